// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Administration tool for external leases volumes.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use xleases::direct::DirectFile;
use xleases::lockman::DirectLockManager;
use xleases::volume;

#[derive(Parser)]
#[command(name = "xleases-tool", version, about = "Manage external leases volumes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format the index of an xleases volume.
    ///
    /// This is a destructive operation, deleting all the leases on
    /// the volume.  It must not be used on an active storage domain.
    /// On block storage the caller is responsible for activating the
    /// lv before, and deactivating it after:
    ///
    ///     lvcreate --name xleases --size 1g <sd_id>
    ///     xleases-tool format-xleases <sd_id> /dev/<sd_id>/xleases
    ///     lvchange -an <sd_id>/xleases
    ///
    /// If this fails the volume is left marked as updating and the
    /// operation can be tried again.
    #[command(name = "format-xleases", verbatim_doc_comment)]
    FormatXleases {
        /// Storage domain UUID.
        sd_id: String,
        /// Path to the xleases volume.
        path: PathBuf,
    },

    /// Rebuild the index of an xleases volume from storage.
    ///
    /// Synchronizes the index with the leases actually present on the
    /// volume.  It must not be used on an active storage domain.  If
    /// this fails the volume is left marked as updating and the
    /// operation can be tried again.
    #[command(name = "rebuild-xleases", verbatim_doc_comment)]
    RebuildXleases {
        /// Storage domain UUID.
        sd_id: String,
        /// Path to the xleases volume.
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let res = match &cli.command {
        Command::FormatXleases { sd_id, path } => format_xleases(sd_id, path),
        Command::RebuildXleases { sd_id, path } => rebuild_xleases(sd_id, path),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("xleases-tool: {e}");
            ExitCode::FAILURE
        }
    }
}

fn format_xleases(sd_id: &str, path: &Path) -> xleases::Result<()> {
    let mut file = DirectFile::open(path)?;
    volume::format_index(sd_id, &mut file)
}

fn rebuild_xleases(sd_id: &str, path: &Path) -> xleases::Result<()> {
    let mut file = DirectFile::open(path)?;
    volume::rebuild_index(sd_id, &mut file, &DirectLockManager)
}
