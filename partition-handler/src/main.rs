// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use partition_sys::{Action, Config, Dispatcher, SysError};
use std::path::PathBuf;
use std::process::ExitCode;

/// Privileged helper mapping raw disk images to loop devices
#[derive(Debug, Parser)]
#[command(name = "partition-handler")]
#[command(about = "Create, mount, unmount and remove loop devices for raw disk images", long_about = None)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["add", "remove", "mount", "umount"]),
))]
struct Cli {
    /// Create a loop device for an image file and print its path
    #[arg(short = 'a', long, value_name = "RAW_IMAGE_FILE")]
    add: Option<PathBuf>,

    /// Remove a loop device, or the loop device mounted at a mount point after unmounting it
    #[arg(short = 'r', long, value_name = "LOOP_DEVICE|MOUNT_POINT")]
    remove: Option<PathBuf>,

    /// Mount a loop device, or create a loop device for an image file and mount it
    #[arg(short = 'm', long, num_args = 2, value_names = ["LOOP_DEVICE|RAW_IMAGE_FILE", "MOUNT_POINT"])]
    mount: Option<Vec<PathBuf>>,

    /// Unmount a partition
    #[arg(short = 'u', long, value_name = "MOUNT_POINT")]
    umount: Option<PathBuf>,

    /// Filesystem type used for mounting
    #[arg(short = 't', long = "fstype", value_name = "TYPE")]
    fs_type: Option<String>,

    /// Do not ask the kernel to scan new loop devices for partitions
    #[arg(long)]
    no_partscan: bool,

    /// Mount read-only
    #[arg(long)]
    read_only: bool,

    /// Configuration file (defaults to $PARTITION_HANDLER_CONFIG or /etc/partition-handler.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Log debug details to stderr
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn action(&self) -> Option<Action> {
        if let Some(image) = &self.add {
            return Some(Action::Add {
                image: image.clone(),
            });
        }
        if let Some(target) = &self.remove {
            return Some(Action::Remove {
                target: target.clone(),
            });
        }
        if let Some([source, mount_point]) = self.mount.as_deref() {
            return Some(Action::Mount {
                source: source.clone(),
                mount_point: mount_point.clone(),
            });
        }
        self.umount.as_ref().map(|target| Action::Umount {
            target: target.clone(),
        })
    }

    fn apply_overrides(&self, config: &mut Config) {
        if let Some(fs_type) = &self.fs_type {
            config.fs_type = fs_type.clone();
        }
        if self.no_partscan {
            config.partition_scan = false;
        }
        if self.read_only {
            config.read_only = true;
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "partition_handler=debug,partition_sys=debug"
    } else {
        "partition_handler=warn,partition_sys=warn"
    };

    // stderr only, stdout carries results
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let action = cli
        .action()
        .ok_or_else(|| SysError::Argument("no action given".to_string()))?;

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply_overrides(&mut config);
    tracing::debug!("Effective configuration: {:?}", config);

    let outcome = Dispatcher::new(config).run(action)?;

    if cli.json {
        println!("{}", serde_json::to_string(&outcome)?);
    } else {
        println!("{}", outcome);
    }
    Ok(())
}

fn main() -> ExitCode {
    let parsed = Cli::try_parse();

    // --help and --version are not errors
    if let Err(e) = &parsed
        && !e.use_stderr()
    {
        let _ = e.print();
        return ExitCode::SUCCESS;
    }

    init_logging(parsed.as_ref().is_ok_and(|cli| cli.verbose));

    if unsafe { libc::geteuid() } != 0 {
        tracing::error!("Refusing to run without root privileges");
        eprintln!("Error: {}", SysError::Privilege);
        return ExitCode::FAILURE;
    }

    let cli = match parsed {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
