//! JSON seed file: the identities the in-process allocator and local store start with,
//! plus an optional script of changes replayed by `watch`.

use std::path::Path;

use anyhow::{Context, Result};
use idcache_core::{AllocatorKey, Label, LabelArray, NumericIdentity};
use idcache_kvstore::KvAllocator;
use idcache_store::LocalIdentities;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub global: Vec<SeedIdentity>,
    #[serde(default)]
    pub local: Vec<Vec<String>>,
    #[serde(default)]
    pub unrecognized: Vec<SeedRaw>,
    #[serde(default)]
    pub changes: Vec<SeedChange>,
}

#[derive(Debug, Deserialize)]
pub struct SeedIdentity {
    /// Fixed id as written by another node; allocated when absent.
    pub id: Option<u32>,
    pub labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SeedRaw {
    pub id: u32,
    pub kind: String,
    #[serde(default)]
    pub raw: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum SeedChange {
    Allocate { labels: Vec<String> },
    Release { id: u32 },
}

pub fn parse_labels(raw: &[String]) -> Result<LabelArray> {
    raw.iter()
        .map(|s| s.parse::<Label>().with_context(|| format!("parsing label {:?}", s)))
        .collect::<Result<Vec<_>>>()
        .map(LabelArray::from)
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading seed file {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing seed file {}", path.display()))
    }

    /// Populate the stores. `kv` is skipped in local-only mode.
    pub fn apply(&self, kv: Option<&KvAllocator>, local: &LocalIdentities) -> Result<()> {
        if let Some(kv) = kv {
            for g in &self.global {
                let labels = parse_labels(&g.labels)?;
                match g.id {
                    Some(id) => kv.insert_raw(NumericIdentity(id), AllocatorKey::Global(labels))?,
                    None => {
                        kv.allocate(labels).context("allocating seeded identity")?;
                    }
                }
            }
            for r in &self.unrecognized {
                kv.insert_raw(NumericIdentity(r.id), AllocatorKey::Unrecognized { kind: r.kind.clone(), raw: r.raw.clone() })?;
            }
        } else if !self.global.is_empty() {
            warn!(count = self.global.len(), "local-only mode; global seed entries ignored");
        }
        for l in &self.local {
            local.allocate(parse_labels(l)?).context("allocating local identity")?;
        }
        info!(global = self.global.len(), local = self.local.len(), "seed applied");
        Ok(())
    }
}

pub fn apply_change(kv: &KvAllocator, change: &SeedChange) -> Result<()> {
    match change {
        SeedChange::Allocate { labels } => {
            kv.allocate(parse_labels(labels)?)?;
        }
        SeedChange::Release { id } => {
            if !kv.release(NumericIdentity(*id))? {
                warn!(id, "release of unknown identity");
            }
        }
    }
    Ok(())
}
