use anyhow::{anyhow, bail, Result};
use clap::{arg, command, ArgAction, Command};
use dedupfs::commit::{mkfs, CachePaths, MkfsOptions};
use dedupfs::fsck::{fsck_run, FsckOptions};
use dedupfs::utils::{init_logs, DEFAULT_CACHEDIR};
use log::*;
use object_backend::local::LocalBackend;
use object_backend::Backend;
use std::env::set_var;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn get_backend(storage_url: &str) -> Result<Arc<dyn Backend>> {
    if let Some(path) = storage_url.strip_prefix("local://") {
        Ok(Arc::new(LocalBackend::new(Path::new(path))?))
    } else {
        bail!("unsupported storage url: {}", storage_url)
    }
}

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .subcommand_required(true)
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
            .action(ArgAction::SetTrue)
            .global(true))
        .arg(arg!(--cachedir <DIR> "Directory for metadata and block caches")
            .required(false)
            .global(true))
        .subcommand(Command::new("mkfs")
            .about("Initializes a new file system")
            .arg(arg!(<storage_url> "Storage URL, e.g. local:///path/to/bucket"))
            .arg(arg!(--blocksize <KB> "Maximum block size in KiB")
                .value_parser(clap::value_parser!(u64))
                .default_value("10240"))
            .arg(arg!(-L --label <name> "File system label")
                .default_value(""))
            .arg(arg!(--plain "Create unencrypted file system").action(ArgAction::SetTrue))
            .arg(arg!(--force "Overwrite any existing data").action(ArgAction::SetTrue)))
        .subcommand(Command::new("fsck")
            .about("Checks and repairs a file system")
            .arg(arg!(<storage_url> "Storage URL, e.g. local:///path/to/bucket"))
            .arg(arg!(--batch "If user input is required, exit without prompting")
                .action(ArgAction::SetTrue))
            .arg(arg!(--force "Force checking even if file system is marked clean")
                .action(ArgAction::SetTrue)))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();

    let cachedir = matches
        .get_one::<String>("cachedir")
        .map(PathBuf::from)
        .unwrap_or_else(|| DEFAULT_CACHEDIR.clone());

    match matches.subcommand() {
        Some(("mkfs", sub)) => {
            let storage_url = sub.get_one::<String>("storage_url").unwrap();
            let backend = get_backend(storage_url)?;
            let paths = CachePaths::new(&cachedir, storage_url);
            let opts = MkfsOptions {
                blocksize_kib: *sub.get_one::<u64>("blocksize").unwrap(),
                label: sub.get_one::<String>("label").unwrap().clone(),
                plain: sub.get_flag("plain"),
                force: sub.get_flag("force"),
            };
            info!("Creating file system on {}", storage_url);
            mkfs(backend.as_ref(), &paths, &opts)
                .map_err(|e| anyhow!("mkfs failed: {}", e))?;
            Ok(())
        }
        Some(("fsck", sub)) => {
            let storage_url = sub.get_one::<String>("storage_url").unwrap();
            let backend = get_backend(storage_url)?;
            let paths = CachePaths::new(&cachedir, storage_url);
            let opts = FsckOptions {
                batch: sub.get_flag("batch"),
                force: sub.get_flag("force"),
                accept_outdated: false,
            };
            info!("Checking file system on {}", storage_url);
            fsck_run(backend.as_ref(), &paths, &opts)
                .map_err(|e| anyhow!("fsck failed: {}", e))?;
            Ok(())
        }
        _ => unreachable!("subcommand required"),
    }
}
