use crate::wire::DEFAULT_MAX_OBJECT_BYTES;
use clap::Parser;
use hub_core::protocol::MessageKind;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONTROL_PORT: u16 = 31093;
pub const DEFAULT_PORT_SPAN: u16 = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {setting} '{value}'")]
    InvalidPort { setting: &'static str, value: String },
    #[error("invalid master address '{0}' (expected host[:port])")]
    InvalidMaster(String),
    #[error("invalid bind address '{0}'")]
    InvalidBind(String),
    #[error("unknown ui '{0}' (expected gui, tui or none)")]
    InvalidUi(String),
    #[error("invalid trace filter: {0}")]
    InvalidTrace(String),
    #[error("invalid object size limit '{0}' (expected MiB > 0)")]
    InvalidObjectLimit(String),
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "hub-rs", about = "Session hub: control routing, bulk data proxy and TCP tunnels")]
pub struct Args {
    /// Script run on the master once the manager has connected
    pub script: Option<PathBuf>,
    #[arg(long, default_value = "")]
    pub port: String,
    #[arg(long, default_value = "")]
    pub data_port: String,
    #[arg(long, default_value_t = DEFAULT_PORT_SPAN)]
    pub port_span: u16,
    /// Join the master hub at host[:port] instead of acting as master
    #[arg(long = "hub", default_value = "")]
    pub master: String,
    #[arg(long, default_value = "")]
    pub name: String,
    #[arg(long, default_value = "")]
    pub bind: String,
    /// Host peers should use to reach this hub
    #[arg(long, default_value = "")]
    pub advertise: String,
    #[arg(long, default_value = "")]
    pub script_interpreter: String,
    #[arg(long, default_value_t = false, conflicts_with_all = ["tui", "batch"])]
    pub gui: bool,
    #[arg(long, default_value_t = false, conflicts_with = "batch")]
    pub tui: bool,
    #[arg(long, default_value_t = false)]
    pub batch: bool,
    #[arg(long, default_value = "")]
    pub bin_dir: String,
    #[arg(long, default_value = "")]
    pub manager: String,
    #[arg(long, default_value_t = false)]
    pub no_manager: bool,
    #[arg(long, default_value = "")]
    pub module_dir: String,
    #[arg(long, default_value = "")]
    pub launcher: String,
    #[arg(long, default_value_t = 100)]
    pub poll_ms: u64,
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    #[arg(long, default_value_t = 1024)]
    pub queue_capacity: usize,
    /// Largest bulk object accepted on the data port, in MiB
    #[arg(long, default_value = "")]
    pub max_object_mb: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Log a routing line for every message of this kind ("any" for all)
    #[arg(long, default_value = "")]
    pub trace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterAddr {
    pub host: String,
    pub port: u16,
}

impl MasterAddr {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        let invalid = || ConfigError::InvalidMaster(value.to_string());
        let (host, port) = match value.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                (host.trim_start_matches('[').trim_end_matches(']'), port)
            }
            _ => (value, DEFAULT_CONTROL_PORT),
        };
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for MasterAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiMode {
    Gui,
    Tui,
    None,
}

impl UiMode {
    pub fn executable(&self) -> Option<&'static str> {
        match self {
            UiMode::Gui => Some("hub-gui"),
            UiMode::Tui => Some("hub-tui"),
            UiMode::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFilter {
    All,
    Kind(MessageKind),
}

impl TraceFilter {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim() {
            "any" | "all" => Ok(TraceFilter::All),
            other => other
                .parse::<MessageKind>()
                .map(TraceFilter::Kind)
                .map_err(ConfigError::InvalidTrace),
        }
    }

    pub fn matches(&self, kind: MessageKind) -> bool {
        match self {
            TraceFilter::All => true,
            TraceFilter::Kind(filter) => *filter == kind,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub bind_host: IpAddr,
    pub control_port: u16,
    /// `None` means one above the bound control port.
    pub data_port: Option<u16>,
    pub port_span: u16,
    pub master: Option<MasterAddr>,
    pub advertise_host: Option<String>,
    pub name: String,
    pub script: Option<PathBuf>,
    pub script_interpreter: String,
    pub ui: UiMode,
    pub bin_dir: PathBuf,
    pub manager: Option<PathBuf>,
    pub module_dir: Option<PathBuf>,
    pub launcher: Option<String>,
    pub poll_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_object_bytes: u64,
    pub log_dir: Option<PathBuf>,
    pub debug: bool,
    pub trace: Option<TraceFilter>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: DEFAULT_CONTROL_PORT,
            data_port: None,
            port_span: DEFAULT_PORT_SPAN,
            master: None,
            advertise_host: None,
            name: "localhost".to_string(),
            script: None,
            script_interpreter: "python3".to_string(),
            ui: UiMode::None,
            bin_dir: PathBuf::from("."),
            manager: None,
            module_dir: None,
            launcher: None,
            poll_interval: Duration::from_millis(100),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 1024,
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
            log_dir: None,
            debug: false,
            trace: None,
        }
    }
}

impl HubConfig {
    pub fn is_master(&self) -> bool {
        self.master.is_none()
    }

    /// Resolves each setting from its flag, then `env`, then the default.
    pub fn from_args(
        args: Args,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let lookup = |flag: &str, key: &str| -> Option<String> {
            if !flag.trim().is_empty() {
                return Some(flag.trim().to_string());
            }
            env(key).filter(|value| !value.trim().is_empty())
        };
        let defaults = HubConfig::default();

        let control_port = match lookup(&args.port, "HUB_PORT") {
            Some(value) => parse_port("control port", &value)?,
            None => defaults.control_port,
        };
        let data_port = lookup(&args.data_port, "HUB_DATA_PORT")
            .map(|value| parse_port("data port", &value))
            .transpose()?;
        let master = lookup(&args.master, "HUB_MASTER")
            .map(|value| MasterAddr::parse(&value))
            .transpose()?;
        let bind_host = match lookup(&args.bind, "HUB_BIND") {
            Some(value) => value
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidBind(value))?,
            None => defaults.bind_host,
        };
        let name = lookup(&args.name, "HUB_NAME").unwrap_or_else(|| default_hostname(env));
        let bin_dir = lookup(&args.bin_dir, "HUB_BIN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_bin_dir);
        let manager = if args.no_manager {
            None
        } else {
            Some(
                lookup(&args.manager, "HUB_MANAGER")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| bin_dir.join("hub-manager")),
            )
        };
        let ui = resolve_ui(&args, master.is_none(), env)?;
        let trace = lookup(&args.trace, "HUB_TRACE")
            .map(|value| TraceFilter::parse(&value))
            .transpose()?;
        let debug = args.debug || env_true(env, "HUB_DEBUG");
        let max_object_bytes = match lookup(&args.max_object_mb, "HUB_MAX_OBJECT_MB") {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|mb| *mb > 0)
                .and_then(|mb| mb.checked_mul(1 << 20))
                .ok_or(ConfigError::InvalidObjectLimit(value))?,
            None => defaults.max_object_bytes,
        };

        Ok(Self {
            bind_host,
            control_port,
            data_port,
            port_span: args.port_span.max(1),
            master,
            advertise_host: lookup(&args.advertise, "HUB_ADVERTISE"),
            name,
            script: args.script,
            script_interpreter: lookup(&args.script_interpreter, "HUB_SCRIPT_INTERPRETER")
                .unwrap_or(defaults.script_interpreter),
            ui,
            bin_dir,
            manager,
            module_dir: lookup(&args.module_dir, "HUB_MODULE_DIR").map(PathBuf::from),
            launcher: lookup(&args.launcher, "HUB_LAUNCHER"),
            poll_interval: Duration::from_millis(args.poll_ms.max(1)),
            write_timeout: Duration::from_secs(args.write_timeout.max(1)),
            queue_capacity: args.queue_capacity.max(1),
            max_object_bytes,
            log_dir: lookup(&args.log_dir, "HUB_LOG_DIR").map(PathBuf::from),
            debug,
            trace,
        })
    }
}

pub fn load_config() -> Result<HubConfig, ConfigError> {
    HubConfig::from_args(Args::parse(), &|key| std::env::var(key).ok())
}

fn parse_port(setting: &'static str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidPort {
            setting,
            value: value.to_string(),
        })
}

fn resolve_ui(
    args: &Args,
    is_master: bool,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<UiMode, ConfigError> {
    if args.batch {
        return Ok(UiMode::None);
    }
    if args.gui {
        return Ok(UiMode::Gui);
    }
    if args.tui {
        return Ok(UiMode::Tui);
    }
    if let Some(value) = env("HUB_UI").filter(|value| !value.trim().is_empty()) {
        return match value.trim().to_lowercase().as_str() {
            "gui" => Ok(UiMode::Gui),
            "tui" => Ok(UiMode::Tui),
            "none" | "batch" => Ok(UiMode::None),
            _ => Err(ConfigError::InvalidUi(value)),
        };
    }
    if let Some(pbs) = env("PBS_ENVIRONMENT") {
        if pbs.trim() != "PBS_INTERACTIVE" {
            return Ok(UiMode::None);
        }
    }
    Ok(if is_master { UiMode::Gui } else { UiMode::None })
}

fn env_true(env: &dyn Fn(&str) -> Option<String>, key: &str) -> bool {
    match env(key) {
        Some(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => false,
    }
}

fn default_hostname(env: &dyn Fn(&str) -> Option<String>) -> String {
    if let Some(value) = env("HOSTNAME").filter(|value| !value.trim().is_empty()) {
        return value.trim().to_string();
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_bin_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    fn args() -> Args {
        Args {
            port_span: DEFAULT_PORT_SPAN,
            poll_ms: 100,
            write_timeout: 2,
            queue_capacity: 1024,
            ..Args::default()
        }
    }

    #[test]
    fn defaults_make_a_gui_master_with_bundled_manager() {
        let env = env_from(&[("HOSTNAME", "front")]);
        let config = HubConfig::from_args(
            Args {
                bin_dir: "/opt/hub/bin".to_string(),
                ..args()
            },
            &env,
        )
        .expect("config");
        assert!(config.is_master());
        assert_eq!(config.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(config.data_port, None);
        assert_eq!(config.name, "front");
        assert_eq!(config.ui, UiMode::Gui);
        assert_eq!(config.manager, Some(PathBuf::from("/opt/hub/bin/hub-manager")));
        assert_eq!(config.script_interpreter, "python3");
        assert_eq!(config.max_object_bytes, DEFAULT_MAX_OBJECT_BYTES);
    }

    #[test]
    fn object_limit_is_given_in_mebibytes() {
        let env = env_from(&[("HUB_MAX_OBJECT_MB", "64")]);
        let config = HubConfig::from_args(args(), &env).expect("config");
        assert_eq!(config.max_object_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn flags_win_over_environment() {
        let env = env_from(&[("HUB_PORT", "4000"), ("HUB_NAME", "from-env")]);
        let config = HubConfig::from_args(
            Args {
                port: "5000".to_string(),
                ..args()
            },
            &env,
        )
        .expect("config");
        assert_eq!(config.control_port, 5000);
        assert_eq!(config.name, "from-env");
    }

    #[test]
    fn slave_mode_parses_master_and_skips_ui() {
        let env = env_from(&[("HUB_MASTER", "cluster-head:32000")]);
        let config = HubConfig::from_args(args(), &env).expect("config");
        assert_eq!(
            config.master,
            Some(MasterAddr {
                host: "cluster-head".to_string(),
                port: 32000
            })
        );
        assert_eq!(config.ui, UiMode::None);
    }

    #[test]
    fn master_address_defaults_port_and_accepts_ipv6() {
        assert_eq!(
            MasterAddr::parse("head").expect("host only").port,
            DEFAULT_CONTROL_PORT
        );
        let v6 = MasterAddr::parse("[::1]:4100").expect("v6");
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.port, 4100);
        assert!(MasterAddr::parse("head:notaport").is_err());
        assert!(MasterAddr::parse(":31093").is_err());
    }

    #[test]
    fn batch_jobs_do_not_launch_a_ui() {
        let env = env_from(&[("PBS_ENVIRONMENT", "PBS_BATCH")]);
        assert_eq!(
            HubConfig::from_args(args(), &env).expect("config").ui,
            UiMode::None
        );

        let interactive = env_from(&[("PBS_ENVIRONMENT", "PBS_INTERACTIVE")]);
        assert_eq!(
            HubConfig::from_args(args(), &interactive).expect("config").ui,
            UiMode::Gui
        );

        let forced = HubConfig::from_args(
            Args {
                tui: true,
                ..args()
            },
            &env,
        )
        .expect("config");
        assert_eq!(forced.ui, UiMode::Tui);
    }

    #[test]
    fn invalid_values_are_reported() {
        let env = env_from(&[]);
        assert!(matches!(
            HubConfig::from_args(
                Args {
                    port: "99999".to_string(),
                    ..args()
                },
                &env
            ),
            Err(ConfigError::InvalidPort { .. })
        ));
        assert!(matches!(
            HubConfig::from_args(
                Args {
                    trace: "hello".to_string(),
                    ..args()
                },
                &env
            ),
            Err(ConfigError::InvalidTrace(_))
        ));
        assert!(matches!(
            HubConfig::from_args(
                Args {
                    max_object_mb: "0".to_string(),
                    ..args()
                },
                &env
            ),
            Err(ConfigError::InvalidObjectLimit(_))
        ));
        let bad_ui = env_from(&[("HUB_UI", "web")]);
        assert!(matches!(
            HubConfig::from_args(args(), &bad_ui),
            Err(ConfigError::InvalidUi(_))
        ));
    }

    #[test]
    fn debug_and_trace_resolve() {
        let env = env_from(&[("HUB_DEBUG", "yes")]);
        let config = HubConfig::from_args(
            Args {
                trace: "spawn".to_string(),
                no_manager: true,
                ..args()
            },
            &env,
        )
        .expect("config");
        assert!(config.debug);
        assert_eq!(config.manager, None);
        let trace = config.trace.expect("trace");
        assert!(trace.matches(MessageKind::Spawn));
        assert!(!trace.matches(MessageKind::Quit));
        assert!(TraceFilter::parse("any").expect("any").matches(MessageKind::Quit));
    }
}
