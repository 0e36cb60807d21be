//! imgmount: mount layered disk images as a synthetic FUSE filesystem.
//!
//! Opens a differencing-image chain, enumerates the volumes on the composed
//! disk and exposes everything under one mount point: `/vhdd` for the whole
//! disk, `/vol<N>` per volume, `/fs<N>` for recognized guest filesystems and
//! a symlink named after the base image.

mod list;

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use fuser::MountOption;
use log::{info, LevelFilter};

use fsbridge::{ImgFs, MountSession};
use storage::{open_chain, CatalogOptions, ChainConfig, SecretKeyStore};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "imgmount")]
#[command(version)]
#[command(about = "Mount layered disk images and their volumes as a filesystem")]
struct Cli {
    /// Disk image to open (path, or a UUID known to a media registry)
    #[arg(short, long, value_name = "UUID|PATH")]
    image: Option<String>,

    /// Open the image chain for writing (default: read-only)
    #[arg(long)]
    rw: bool,

    /// Allow root to access the mounted filesystem
    #[arg(long)]
    root: bool,

    /// Scope a listing to one VM's media
    #[arg(long, value_name = "ID")]
    vm: Option<String>,

    /// List the volumes of --image instead of mounting
    #[arg(short, long)]
    list: bool,

    /// Attempt to mount a recognized guest filesystem per volume
    #[arg(short = 'g', long = "guest-filesystem")]
    guest_filesystem: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Add exact byte columns to the listing
    #[arg(short, long)]
    wide: bool,

    /// Where to mount the synthetic filesystem
    #[arg(value_name = "MOUNT_POINT")]
    mount_point: Option<PathBuf>,
}

/// Operator-facing failures; all of them end the process before (or instead
/// of) exposing a filesystem.
#[derive(Debug)]
enum AppError {
    Config(String),
    Storage(storage::Error),
    Mount(std::io::Error),
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn init_logger(verbosity: u8) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
        return;
    }
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .filter(None, level)
        .init();
}

/// Turns the `--image` argument into a chain configuration.
///
/// There is no management-API registry in this build, so a bare UUID (or any
/// non-existent path) is a configuration error directing the operator to pass
/// a filesystem path instead.
fn image_config(cli: &Cli) -> Result<ChainConfig, AppError> {
    if cli.vm.is_some() {
        return Err(AppError::Config(
            "--vm requires a media registry, which is not available; \
             pass the image path via --image instead"
                .to_string(),
        ));
    }

    let Some(image) = &cli.image else {
        if cli.list {
            return Err(AppError::Config(
                "listing all media requires a registry, which is not available; \
                 pass --image to list one image's volumes"
                    .to_string(),
            ));
        }
        return Err(AppError::Config("--image is required".to_string()));
    };

    let path = PathBuf::from(image);
    if !path.exists() && looks_like_uuid(image) {
        return Err(AppError::Config(format!(
            "'{}' looks like a UUID; media registries are not available, \
             pass the image's path instead",
            image
        )));
    }

    Ok(ChainConfig {
        image: path,
        write: cli.rw,
        crypto: None,
    })
}

fn looks_like_uuid(s: &str) -> bool {
    s.len() == 36
        && s.bytes().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

fn run(cli: &Cli) -> Result<(), AppError> {
    let cfg = image_config(cli)?;
    let keystore = SecretKeyStore::new();

    let chain = open_chain(&cfg, &keystore).map_err(storage::Error::from).map_err(AppError::Storage)?;
    let opts = CatalogOptions {
        guest_fs: cli.guest_filesystem,
    };
    let session = MountSession::open(chain, &opts).map_err(AppError::Storage)?;

    if cli.list {
        list::print_volumes(&session, cli.wide);
        return Ok(());
    }

    let Some(mount_point) = &cli.mount_point else {
        return Err(AppError::Config("a mount point is required".to_string()));
    };

    let mut options = vec![
        MountOption::FSName("imgmount".to_string()),
        if cli.rw { MountOption::RW } else { MountOption::RO },
    ];
    if cli.root {
        options.push(MountOption::AllowRoot);
    }

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let fs = ImgFs::new(Arc::new(session), uid, gid);

    info!(
        "mounting at {} ({})",
        mount_point.display(),
        if cli.rw { "read-write" } else { "read-only" }
    );
    fuser::mount2(fs, mount_point, &options).map_err(AppError::Mount)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("imgmount: {}", e);
            ExitCode::FAILURE
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "configuration error: {}", msg),
            AppError::Storage(e) => write!(f, "{}", e),
            AppError::Mount(e) => write!(f, "mount failed: {}", e),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
