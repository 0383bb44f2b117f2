use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::device::enumerator::DEFAULT_DEV_DIR;
use crate::device::enumerator::DEFAULT_SYSFS_DIR;

pub const DEFAULT_DEVICE_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";
pub const DEFAULT_SOCKET_NAME: &str = "v4l2l.sock";
pub const DEFAULT_KUBELET_SOCKET_NAME: &str = "kubelet.sock";
pub const DEFAULT_RESOURCE_NAME: &str = "mpreu.de/v4l2l";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin daemon
    Daemon(Box<DaemonArgs>),
    /// Print the devices the daemon would advertise
    #[command(name = "list-devices")]
    ListDevices(DiscoveryArgs),
}

/// Where to look for devices on the host.
#[derive(Args, Clone, Debug)]
pub struct DiscoveryArgs {
    #[arg(
        long,
        env = "V4L2L_SYSFS_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_SYSFS_DIR,
        help = "sysfs directory listing virtual video4linux devices"
    )]
    pub sysfs_dir: PathBuf,

    #[arg(
        long,
        env = "V4L2L_DEV_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_DEV_DIR,
        help = "Directory holding the video device nodes"
    )]
    pub dev_dir: PathBuf,

    #[arg(
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        value_parser = LOG_LEVELS,
        help = "Log verbosity (error, warn, info, debug, trace), overridden by RUST_LOG"
    )]
    pub log_level: String,
}

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub discovery: DiscoveryArgs,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_DEVICE_PLUGIN_DIR,
        help = "Kubelet device plugin directory holding both sockets"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_SOCKET_NAME",
        default_value = DEFAULT_SOCKET_NAME,
        help = "File name of this plugin's socket inside the device plugin directory"
    )]
    pub socket_name: String,

    #[arg(
        long,
        env = "KUBELET_SOCKET_NAME",
        default_value = DEFAULT_KUBELET_SOCKET_NAME,
        help = "File name of the kubelet registration socket"
    )]
    pub kubelet_socket_name: String,

    #[arg(
        long,
        env = "RESOURCE_NAME",
        default_value = DEFAULT_RESOURCE_NAME,
        help = "Extended resource name advertised to the kubelet"
    )]
    pub resource_name: String,

    #[arg(
        long,
        env = "CONNECT_TIMEOUT_SECS",
        default_value = "5",
        help = "Timeout in seconds for the server check and the registration call"
    )]
    pub connect_timeout_secs: u64,

    #[arg(
        long,
        env = "WATCH_KUBELET",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Register again when the kubelet socket is re-created"
    )]
    pub watch_kubelet: bool,

    #[arg(
        long,
        env = "LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily, e.g. /logs/v4l2l.log"
    )]
    pub log_file: Option<PathBuf>,
}

/// Settings the plugin lifecycle needs.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub device_plugin_dir: PathBuf,
    pub socket_name: String,
    pub kubelet_socket_name: String,
    pub resource_name: String,
    pub connect_timeout: Duration,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            device_plugin_dir: PathBuf::from(DEFAULT_DEVICE_PLUGIN_DIR),
            socket_name: DEFAULT_SOCKET_NAME.to_string(),
            kubelet_socket_name: DEFAULT_KUBELET_SOCKET_NAME.to_string(),
            resource_name: DEFAULT_RESOURCE_NAME.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl PluginConfig {
    /// Socket this plugin serves on.
    pub fn socket_path(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.socket_name)
    }

    /// Socket the kubelet accepts registrations on.
    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.kubelet_socket_name)
    }
}

impl From<&DaemonArgs> for PluginConfig {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            device_plugin_dir: args.device_plugin_dir.clone(),
            socket_name: args.socket_name.clone(),
            kubelet_socket_name: args.kubelet_socket_name.clone(),
            resource_name: args.resource_name.clone(),
            connect_timeout: Duration::from_secs(args.connect_timeout_secs.max(1)),
        }
    }
}
