//! Record-stream codec for transforms.
//!
//! A serialized transform is a magic line followed by records. Each record
//! is a one-line JSON header, then `length` raw bytes, then a newline:
//!
//! ```text
//! brz-transform-records 1
//! {"record":"attribs","length":312}
//! {"_id_number":7,"_new_name":{...},...}
//! {"record":"content","trans_id":"new-3","kind":"file","length":5}
//! hello
//! {"record":"end"}
//! ```
//!
//! The attribs record carries every ledger map. Each node with new content
//! gets its own content record, so file bodies never pass through JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransformError};
use crate::model::types::{FileId, Kind, RevisionId, TransId};

use super::TreeTransform;
use super::ledger::{Ledger, NewContents};

const MAGIC: &str = "brz-transform-records 1";

/// A decoded content record.
type Staged = (TransId, Kind, Vec<u8>);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "lowercase")]
enum RecordHeader {
    Attribs {
        length: usize,
    },
    Content {
        trans_id: TransId,
        kind: Kind,
        length: usize,
    },
    End,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Attribs {
    #[serde(rename = "_id_number")]
    id_number: u64,
    #[serde(rename = "_new_name")]
    new_name: BTreeMap<TransId, String>,
    #[serde(rename = "_new_parent")]
    new_parent: BTreeMap<TransId, TransId>,
    #[serde(rename = "_new_executability")]
    new_executability: BTreeMap<TransId, bool>,
    #[serde(rename = "_new_id")]
    new_id: BTreeMap<TransId, FileId>,
    #[serde(rename = "_new_reference_revision", default)]
    new_reference_revision: BTreeMap<TransId, RevisionId>,
    #[serde(rename = "_tree_path_ids")]
    tree_path_ids: BTreeMap<String, TransId>,
    #[serde(rename = "_removed_id")]
    removed_id: BTreeSet<TransId>,
    #[serde(rename = "_removed_contents")]
    removed_contents: BTreeSet<TransId>,
    #[serde(rename = "_non_present_ids", default)]
    non_present_ids: BTreeMap<FileId, TransId>,
    #[serde(rename = "_observed_sha1s", default)]
    observed_sha1s: BTreeMap<TransId, String>,
}

impl Attribs {
    fn from_ledger(ledger: &Ledger) -> Self {
        Self {
            id_number: ledger.id_number,
            new_name: ledger.new_name.clone(),
            new_parent: ledger.new_parent.clone(),
            new_executability: ledger.new_executability.clone(),
            new_id: ledger.new_id.clone(),
            new_reference_revision: ledger.new_reference_revision.clone(),
            tree_path_ids: ledger.tree_path_ids.clone(),
            removed_id: ledger.removed_id.clone(),
            removed_contents: ledger.removed_contents.clone(),
            non_present_ids: ledger.non_present_ids.clone(),
            observed_sha1s: ledger.observed_sha1s.clone(),
        }
    }

    /// A ledger holding everything but new contents.
    fn into_ledger(self) -> Result<Ledger> {
        let root = self
            .tree_path_ids
            .get("")
            .cloned()
            .ok_or_else(|| corrupt("attribs have no tree root"))?;
        let r_new_id = self
            .new_id
            .iter()
            .map(|(trans_id, file_id)| (file_id.clone(), trans_id.clone()))
            .collect();
        let tree_id_paths = self
            .tree_path_ids
            .iter()
            .map(|(path, trans_id)| (trans_id.clone(), path.clone()))
            .collect();
        let mut ledger = Ledger::new();
        ledger.id_number = self.id_number;
        ledger.new_name = self.new_name;
        ledger.new_parent = self.new_parent;
        ledger.new_executability = self.new_executability;
        ledger.new_id = self.new_id;
        ledger.r_new_id = r_new_id;
        ledger.new_reference_revision = self.new_reference_revision;
        ledger.tree_path_ids = self.tree_path_ids;
        ledger.tree_id_paths = tree_id_paths;
        ledger.removed_id = self.removed_id;
        ledger.removed_contents = self.removed_contents;
        ledger.non_present_ids = self.non_present_ids;
        ledger.observed_sha1s = self.observed_sha1s;
        ledger.root = root;
        Ok(ledger)
    }
}

fn corrupt(reason: impl Into<String>) -> TransformError {
    TransformError::CorruptRecords {
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

fn write_record(out: &mut impl Write, header: &RecordHeader, body: &[u8]) -> Result<()> {
    serde_json::to_writer(&mut *out, header)?;
    out.write_all(b"\n")?;
    if !matches!(header, RecordHeader::End) {
        out.write_all(body)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

impl TreeTransform<'_> {
    /// Write the ledger and all staged content to `out`.
    ///
    /// # Errors
    /// Returns an I/O error writing `out` or reading limbo.
    pub fn serialize<W: Write>(&self, mut out: W) -> Result<()> {
        writeln!(out, "{MAGIC}")?;
        let attribs = serde_json::to_vec(&Attribs::from_ledger(&self.ledger))?;
        write_record(
            &mut out,
            &RecordHeader::Attribs {
                length: attribs.len(),
            },
            &attribs,
        )?;
        for (trans_id, contents) in &self.ledger.new_contents {
            let body = match contents {
                NewContents::File => self.staged_file_bytes(trans_id)?,
                NewContents::Symlink { target } => target.as_bytes().to_vec(),
                NewContents::Directory | NewContents::TreeReference => Vec::new(),
            };
            write_record(
                &mut out,
                &RecordHeader::Content {
                    trans_id: trans_id.clone(),
                    kind: contents.kind(),
                    length: body.len(),
                },
                &body,
            )?;
        }
        write_record(&mut out, &RecordHeader::End, &[])?;
        out.flush()?;
        tracing::debug!(contents = self.ledger.new_contents.len(), "transform serialized");
        Ok(())
    }

    /// Replace this transform's ledger with one read from `input`, restaging
    /// every content record in limbo.
    ///
    /// The transform must not have staged any content yet. The whole stream
    /// is read before anything changes; on any error the transform is left
    /// as it was.
    ///
    /// # Errors
    /// - [`TransformError::CorruptRecords`] for malformed input.
    /// - [`TransformError::DuplicateKey`] if content is already staged.
    /// - I/O errors reading `input` or writing limbo.
    pub fn deserialize<R: BufRead>(&mut self, mut input: R) -> Result<()> {
        self.ensure_not_done()?;
        if let Some(trans_id) = self.ledger.new_contents.keys().next() {
            return Err(TransformError::DuplicateKey {
                table: "new_contents",
                key: trans_id.to_string(),
            });
        }
        let mut line = String::new();
        input.read_line(&mut line)?;
        if line.trim_end_matches('\n') != MAGIC {
            return Err(corrupt(format!("bad magic line {:?}", line.trim_end())));
        }

        let ledger = match read_header(&mut input)? {
            RecordHeader::Attribs { length } => {
                let body = read_body(&mut input, length)?;
                serde_json::from_slice::<Attribs>(&body)?.into_ledger()?
            }
            other => return Err(corrupt(format!("expected attribs record, got {other:?}"))),
        };

        let mut contents = Vec::new();
        let mut seen = BTreeSet::new();
        loop {
            match read_header(&mut input)? {
                RecordHeader::Content {
                    trans_id,
                    kind,
                    length,
                } => {
                    if !seen.insert(trans_id.clone()) {
                        return Err(corrupt(format!("duplicate content record for {trans_id}")));
                    }
                    contents.push((trans_id, kind, read_body(&mut input, length)?));
                }
                RecordHeader::End => break,
                RecordHeader::Attribs { .. } => return Err(corrupt("duplicate attribs record")),
            }
        }

        let count = contents.len();
        let previous = std::mem::replace(&mut self.ledger, ledger);
        let ordered = self.creation_order(contents);
        let mut restaged = Vec::with_capacity(ordered.len());
        for (trans_id, kind, body) in ordered {
            if let Err(e) = self.restage(&trans_id, kind, body) {
                restaged.push(trans_id);
                self.unstage(&restaged);
                self.ledger = previous;
                return Err(e);
            }
            restaged.push(trans_id);
        }
        tracing::debug!(contents = count, "transform deserialized");
        Ok(())
    }

    /// Remove restaged content, children before parents.
    fn unstage(&mut self, restaged: &[TransId]) {
        for trans_id in restaged.iter().rev() {
            if self.ledger.new_contents.contains_key(trans_id)
                && let Err(e) = self.cancel_creation(trans_id)
            {
                tracing::warn!(trans_id = %trans_id, error = %e, "failed to drop restaged content");
            }
            self.limbo.discard(trans_id);
        }
    }

    /// Directories before their children, so children land directly inside
    /// their parent's limbo path.
    fn creation_order(&self, mut contents: Vec<Staged>) -> Vec<Staged> {
        let new_dirs: BTreeSet<&TransId> = contents
            .iter()
            .filter(|(_, kind, _)| *kind == Kind::Directory)
            .map(|(trans_id, _, _)| trans_id)
            .collect();
        let limit = self.ledger.new_parent.len();
        let depths: BTreeMap<TransId, usize> = contents
            .iter()
            .map(|(trans_id, _, _)| {
                let mut depth = 0;
                let mut current = trans_id;
                while depth < limit
                    && let Some(parent) = self.ledger.new_parent.get(current)
                    && new_dirs.contains(parent)
                {
                    depth += 1;
                    current = parent;
                }
                (trans_id.clone(), depth)
            })
            .collect();
        contents.sort_by_key(|(trans_id, _, _)| depths.get(trans_id).copied().unwrap_or(0));
        contents
    }

    fn restage(&mut self, trans_id: &TransId, kind: Kind, body: Vec<u8>) -> Result<()> {
        match kind {
            Kind::File => self.create_file([body], trans_id, None, None),
            Kind::Directory => self.create_directory(trans_id),
            Kind::Symlink => {
                let target = String::from_utf8(body)
                    .map_err(|_| corrupt(format!("symlink target of {trans_id} is not UTF-8")))?;
                self.create_symlink(&target, trans_id)
            }
            Kind::TreeReference => {
                let revision = self
                    .ledger
                    .new_reference_revision
                    .remove(trans_id)
                    .ok_or_else(|| corrupt(format!("tree reference {trans_id} has no revision")))?;
                self.create_tree_reference(revision, trans_id)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

fn read_header(input: &mut impl BufRead) -> Result<RecordHeader> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(corrupt("unexpected end of records"));
    }
    serde_json::from_str(line.trim_end()).map_err(|e| corrupt(format!("bad record header: {e}")))
}

fn read_body(input: &mut impl BufRead, length: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    input.by_ref().take(length as u64 + 1).read_to_end(&mut body)?;
    if body.len() != length + 1 || body.pop() != Some(b'\n') {
        return Err(corrupt("truncated record body"));
    }
    Ok(body)
}
