use crate::manager::StationManager;
use crate::scoreboard::Rankings;
use compact_str::CompactString;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

const SCOREBOARDS_FILE: &str = "scoreboards.bin";

/// Rankings of every board, keyed by station id.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedScoreboards {
    pub global: Rankings,
    pub stations: HashMap<CompactString, Rankings>,
}

pub fn save_state(manager: &StationManager, dir: &str) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Creating data directory {dir}"))?;

    let state = PersistedScoreboards {
        global: manager.global().snapshot(),
        stations: manager
            .stations()
            .iter()
            .map(|station| (CompactString::from(station.eva()), station.scoreboard().snapshot()))
            .collect(),
    };

    // The previous file is only replaced once the new one is fully on disk.
    let path = Path::new(dir).join(SCOREBOARDS_FILE);
    let partial = path.with_extension("bin.tmp");
    let mut f = BufWriter::new(
        File::create(&partial).with_context(|| format!("Creating {}", partial.display()))?,
    );
    bincode::serialize_into(&mut f, &state)?;
    f.into_inner()?
        .sync_all()
        .with_context(|| format!("Syncing {}", partial.display()))?;
    std::fs::rename(&partial, &path)
        .with_context(|| format!("Replacing {}", path.display()))?;

    tracing::debug!(stations = state.stations.len(), "Saved scoreboards to disk");
    Ok(())
}

pub fn load_state(dir: &str) -> Result<Option<PersistedScoreboards>> {
    let path = Path::new(dir).join(SCOREBOARDS_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let f = BufReader::new(File::open(&path)?);
    let state: PersistedScoreboards = bincode::deserialize_from(f)
        .with_context(|| format!("Decoding {}", path.display()))?;
    tracing::info!(
        stations = state.stations.len(),
        "Loaded scoreboards from disk"
    );
    Ok(Some(state))
}
