use crate::protocol::{id, Envelope, HubId, Message, ModuleId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Addresses a peer hub publishes for control and bulk-data traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HubData {
    pub id: HubId,
    pub name: String,
    pub host: String,
    pub control_port: u16,
    pub data_port: u16,
}

/// Session state consulted by the hub. The hub feeds it every routed
/// message and replays `state_log` to newly connected peers.
pub trait StateTracker: Send + Sync {
    fn handle(&self, envelope: &Envelope);
    fn state_log(&self) -> Vec<Envelope>;
    fn hub_of(&self, module: ModuleId) -> Option<HubId>;
    fn hub_data(&self, hub: HubId) -> Option<HubData>;
    fn hubs(&self) -> Vec<HubId>;
    fn is_module_running(&self, module: ModuleId) -> bool;
}

#[derive(Debug, Clone)]
struct ModuleRecord {
    hub: HubId,
    name: String,
}

#[derive(Debug, Default)]
struct TrackerState {
    log: Vec<Envelope>,
    modules: BTreeMap<ModuleId, ModuleRecord>,
    hubs: BTreeMap<HubId, HubData>,
}

#[derive(Debug, Default)]
pub struct MemoryStateTracker {
    inner: Mutex<TrackerState>,
}

impl MemoryStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module_name(&self, module: ModuleId) -> Option<String> {
        self.lock().modules.get(&module).map(|record| record.name.clone())
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateTracker for MemoryStateTracker {
    fn handle(&self, envelope: &Envelope) {
        let mut state = self.lock();
        match &envelope.msg {
            Message::Spawn(spawn) => {
                if !id::is_module(spawn.spawn_id) {
                    return;
                }
                state.modules.insert(
                    spawn.spawn_id,
                    ModuleRecord {
                        hub: spawn.hub_id,
                        name: spawn.module_name.clone(),
                    },
                );
            }
            Message::ModuleExit(exit) => {
                if state.modules.remove(&exit.module_id).is_none() {
                    return;
                }
            }
            Message::AddHub(hub) => {
                state.hubs.insert(
                    hub.id,
                    HubData {
                        id: hub.id,
                        name: hub.name.clone(),
                        host: hub.host.clone(),
                        control_port: hub.control_port,
                        data_port: hub.data_port,
                    },
                );
            }
            Message::ModuleAvailable(_) | Message::State(_) => {}
            _ => return,
        }
        state.log.push(envelope.clone());
    }

    fn state_log(&self) -> Vec<Envelope> {
        self.lock().log.clone()
    }

    fn hub_of(&self, module: ModuleId) -> Option<HubId> {
        if id::is_hub(module) {
            return Some(module);
        }
        self.lock().modules.get(&module).map(|record| record.hub)
    }

    fn hub_data(&self, hub: HubId) -> Option<HubData> {
        self.lock().hubs.get(&hub).cloned()
    }

    fn hubs(&self) -> Vec<HubId> {
        self.lock().hubs.keys().copied().collect()
    }

    fn is_module_running(&self, module: ModuleId) -> bool {
        self.lock().modules.contains_key(&module)
    }
}
