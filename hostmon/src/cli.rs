//! Command line interface-related functionality.

use crate::settings::{self, AgentSettings};
use crate::{BootstrapResult, ServiceInfo};
use clap::error::ErrorKind;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::ffi::OsString;

const CONFIG_OPT_ID: &str = "config";
const RUN_AS_ROOT_OPT_ID: &str = "yes-run-as-root";

/// A command line interface (CLI) helper that takes care of the command
/// line argument parsing basics.
///
/// The following command line options are provided:
///
/// - `-c`, `--config` - comma-separated configuration files, later ones
///   overriding earlier ones.
/// - `--yes-run-as-root` - acknowledges that running the agent as root is
///   intended.
/// - `-h`, `--help` - prints CLI help information and exits.
/// - `-V`, `--version` - prints the service version and exits.
pub struct Cli {
    /// Parsed agent settings.
    pub settings: AgentSettings,

    /// Parsed service arguments.
    pub arg_matches: ArgMatches,
}

impl Cli {
    /// Bootstraps a new command line interface (CLI) for the agent.
    ///
    /// The function will implicitly print relevant information and exit the
    /// process if `--help` or `--version` command line options are
    /// specified.
    pub fn new(service_info: &ServiceInfo) -> BootstrapResult<Self> {
        Self::new_from_os_args(service_info, std::env::args_os())
    }

    /// Same as [`Cli::new`], but accepts source OS arguments instead of
    /// taking them from [`std::env::args_os`]. Useful for testing purposes.
    pub fn new_from_os_args(
        service_info: &ServiceInfo,
        os_args: impl IntoIterator<Item = impl Into<OsString> + Clone>,
    ) -> BootstrapResult<Self> {
        let cmd = Command::new(service_info.name)
            .version(service_info.version)
            .author(service_info.author)
            .about(service_info.description)
            .arg(
                Arg::new(CONFIG_OPT_ID)
                    .action(ArgAction::Set)
                    .long("config")
                    .short('c')
                    .help("Comma-separated configuration files for the agent"),
            )
            .arg(
                Arg::new(RUN_AS_ROOT_OPT_ID)
                    .action(ArgAction::SetTrue)
                    .long("yes-run-as-root")
                    .help("Acknowledge that running as root is intended"),
            );

        let arg_matches = get_arg_matches(cmd, os_args)?;

        let config_paths = arg_matches
            .get_one::<String>(CONFIG_OPT_ID)
            .map(|arg| settings::split_config_arg(arg))
            .unwrap_or_default();

        let settings = AgentSettings::load(&config_paths)?;

        Ok(Self {
            settings,
            arg_matches,
        })
    }

    /// Whether `--yes-run-as-root` was passed.
    pub fn allow_root(&self) -> bool {
        self.arg_matches.get_flag(RUN_AS_ROOT_OPT_ID)
    }
}

fn get_arg_matches(
    cmd: Command,
    os_args: impl IntoIterator<Item = impl Into<OsString> + Clone>,
) -> BootstrapResult<ArgMatches> {
    cmd.try_get_matches_from(os_args).map_err(|e| {
        let kind = e.kind();

        // NOTE: print info and terminate the process
        if kind == ErrorKind::DisplayHelp || kind == ErrorKind::DisplayVersion {
            e.exit();
        }

        e.into()
    })
}
