//! Run-file discovery and configuration templates

use hittools::cfg::{ChannelSettings, L2Condition, Settings};
use hittools::err::{Error, Result};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::{HIT_FILE_EXT, SHARD_EXT};

/// Collect the raw hit files of one run: for each version in
/// `start_version..=end_version` the first file named
/// `run{NNNN}_{VVVV}_*` (zero-padded, with the unpadded legacy prefix
/// also accepted). Versions with no file are skipped with a warning.
pub fn run_files(
    directory: &Path,
    run_number: u32,
    start_version: u32,
    end_version: u32,
) -> Result<Vec<PathBuf>> {
    if !directory.is_dir() {
        return Err(Error::Validation(format!(
            "directory not found: {}",
            directory.display()
        )));
    }

    let all: Vec<PathBuf> = directory
        .read_dir()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .sorted()
        .collect();

    let mut files = Vec::new();
    for version in start_version..=end_version {
        let key = format!("run{run_number:04}_{version:04}_");
        let legacy = format!("run{run_number}_{version}_");
        let found = all.iter().find(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            (name.starts_with(&key) || name.starts_with(&legacy))
                && name.ends_with(HIT_FILE_EXT)
        });
        match found {
            Some(path) => files.push(path.clone()),
            None => warn!(run_number, version, "no hit file for this version"),
        }
    }
    Ok(files)
}

/// Shards `{prefix}_0{SHARD_EXT}`, `{prefix}_1...` counting up from
/// zero until the first gap.
pub fn find_shards(directory: &Path, prefix: &str) -> Vec<PathBuf> {
    (0..)
        .map(|i| directory.join(format!("{prefix}_{i}{SHARD_EXT}")))
        .take_while(|path| path.is_file())
        .collect()
}

pub fn shard_path(directory: &Path, prefix: &str, worker: usize) -> PathBuf {
    directory.join(format!("{prefix}_{worker}{SHARD_EXT}"))
}

/// Write the `init` templates: `settings.json`, a dense channel map,
/// and a sample condition program. Existing files are overwritten.
pub fn write_templates(directory: &Path, n_modules: u32, chs_per_module: u32) -> Result<()> {
    let settings = Settings::default();
    settings.save(&directory.join("settings.json"))?;

    let chs_in_mod = vec![chs_per_module; n_modules as usize];
    let map = ChannelSettings::template(&chs_in_mod);
    ChannelSettings::save_map(&directory.join(&settings.channel_settings), &map)?;

    L2Condition::save(&directory.join(&settings.l2_settings), &L2Condition::template())?;
    Ok(())
}
