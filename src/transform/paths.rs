//! Memoised final-path computation.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, TransformError};
use crate::model::inventory::join_path;
use crate::model::types::TransId;

use super::ledger::Ledger;

/// Computes final paths from a ledger, caching every result.
///
/// The ledger is borrowed, so it cannot change while paths are cached.
#[derive(Debug)]
pub struct FinalPaths<'a> {
    ledger: &'a Ledger,
    known: BTreeMap<TransId, String>,
}

impl<'a> FinalPaths<'a> {
    #[must_use]
    pub const fn new(ledger: &'a Ledger) -> Self {
        Self {
            ledger,
            known: BTreeMap::new(),
        }
    }

    /// The final tree-relative path of `trans_id` (`""` for the root).
    ///
    /// # Errors
    /// Returns [`TransformError::NoFinalPath`] if `trans_id` or one of its
    /// final ancestors has no name or parent, or if its ancestry loops.
    pub fn get_path(&mut self, trans_id: &TransId) -> Result<String> {
        if let Some(path) = self.known.get(trans_id) {
            return Ok(path.clone());
        }
        // Walk up until a known or root ancestor, then fill in downwards.
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = trans_id.clone();
        let mut base = loop {
            if let Some(path) = self.known.get(&current) {
                break path.clone();
            }
            if current.is_root_parent() || self.ledger.root() == &current {
                break String::new();
            }
            if !seen.insert(current.clone()) {
                return Err(TransformError::NoFinalPath {
                    trans_id: trans_id.clone(),
                });
            }
            let name = self.ledger.final_name(&current)?;
            let parent = self
                .ledger
                .final_parent(&current)
                .ok_or_else(|| TransformError::NoFinalPath {
                    trans_id: current.clone(),
                })?;
            chain.push((current, name));
            current = parent;
        };
        self.known.insert(current, base.clone());
        while let Some((id, name)) = chain.pop() {
            base = join_path(&base, &name);
            self.known.insert(id, base.clone());
        }
        Ok(base)
    }

    /// `(path, trans_id)` pairs sorted by path.
    ///
    /// # Errors
    /// Fails on the first id with no final path.
    pub fn get_paths<'i>(
        &mut self,
        trans_ids: impl IntoIterator<Item = &'i TransId>,
    ) -> Result<Vec<(String, TransId)>> {
        let mut out = trans_ids
            .into_iter()
            .map(|t| self.get_path(t).map(|p| (p, t.clone())))
            .collect::<Result<Vec<_>>>()?;
        out.sort();
        Ok(out)
    }
}
