//! Filesystem commit for bulk-insert queries.
//!
//! INSERT finalization runs after every backend reported its sink state:
//! 1. under OVERWRITE, clear existing table data (files only at the table
//!    root, whole directories for partitions);
//! 2. create all partition directories;
//! 3. rename tmp files to their final paths;
//! 4. delete the tmp directories the sinks wrote under.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use kite_common::error::{KiteError, Result};
use kite_plan::FinalizeParams;
use tracing::{debug, info};

/// One directory entry returned by [`DistributedFs::list`].
#[derive(Debug, Clone)]
pub struct FsEntry {
    /// Full path of the entry.
    pub path: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Filesystem operations the finalizer needs.
///
/// `delete` treats a missing path as success: a partition directory can
/// legitimately vanish between `exists` and `delete` when a third party
/// removes it, and finalization tolerates that race rather than closing it.
pub trait DistributedFs: Send + Sync {
    /// Lists the direct entries of a directory.
    fn list(&self, dir: &str) -> Result<Vec<FsEntry>>;
    /// Deletes a path; `recursive` is required for non-empty directories.
    fn delete(&self, path: &str, recursive: bool) -> Result<()>;
    /// Renames `src` to `dst`.
    fn rename(&self, src: &str, dst: &str) -> Result<()>;
    /// Creates a directory (and parents); an existing directory is fine.
    fn create_dir(&self, path: &str) -> Result<()>;
    /// Whether a path exists.
    fn exists(&self, path: &str) -> Result<bool>;
}

/// Local-filesystem backend, for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct LocalDfs;

impl DistributedFs for LocalDfs {
    fn list(&self, dir: &str) -> Result<Vec<FsEntry>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            out.push(FsEntry {
                path: entry.path().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let result = if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(path)
            } else {
                fs::remove_dir(path)
            }
        } else {
            fs::remove_file(path)
        };
        match result {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            other => Ok(other?),
        }
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        Ok(fs::rename(src, dst)?)
    }

    fn create_dir(&self, path: &str) -> Result<()> {
        Ok(fs::create_dir_all(path)?)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(Path::new(path).exists())
    }
}

fn partition_path(base_dir: &str, partition_key: &str) -> String {
    if partition_key.is_empty() {
        base_dir.to_string()
    } else {
        format!("{}/{}", base_dir.trim_end_matches('/'), partition_key)
    }
}

/// Commits a bulk-insert query's files.
///
/// `partition_row_counts` names every partition the query wrote;
/// `files_to_move` maps tmp paths to final paths, with an empty final path
/// marking a tmp directory to delete after all moves.
pub fn finalize_insert(
    fs: &dyn DistributedFs,
    params: &FinalizeParams,
    partition_row_counts: &HashMap<String, i64>,
    files_to_move: &BTreeMap<String, String>,
) -> Result<()> {
    info!(
        table = %params.table_name,
        partitions = partition_row_counts.len(),
        moves = files_to_move.len(),
        overwrite = params.is_overwrite,
        operator = "CoordinatorFinalize",
        "finalizing insert"
    );

    let mut partition_keys: Vec<&String> = partition_row_counts.keys().collect();
    partition_keys.sort();

    for partition_key in partition_keys {
        let dir = partition_path(&params.base_dir, partition_key);
        if params.is_overwrite {
            if partition_key.is_empty() {
                // Writing the table root means the table is unpartitioned.
                debug_assert_eq!(partition_row_counts.len(), 1);
                // The sinks' tmp directories live under the root too, and
                // other applications may keep permanent subdirectories here;
                // delete data files only.
                for entry in fs.list(&dir)? {
                    if entry.is_dir {
                        continue;
                    }
                    debug!(path = %entry.path, operator = "CoordinatorFinalize", "deleting");
                    fs.delete(&entry.path, false).map_err(|err| {
                        KiteError::Execution(format!(
                            "failed to delete existing file {} for insert overwrite: {err}",
                            entry.path
                        ))
                    })?;
                }
            } else if fs.exists(&dir)? {
                // A partition directory can be removed wholesale. A third
                // party may delete it between the check and the delete;
                // `delete` tolerates the vanished path.
                fs.delete(&dir, true).map_err(|err| {
                    KiteError::Execution(format!(
                        "failed to delete partition directory {dir} for insert overwrite: {err}"
                    ))
                })?;
            }
        }
        fs.create_dir(&dir)?;
    }

    let mut tmp_dirs_to_delete = Vec::new();
    for (src, dst) in files_to_move {
        if dst.is_empty() {
            // Deleted in a separate pass; its contents may still be moving.
            tmp_dirs_to_delete.push(src.clone());
        } else {
            debug!(src = %src, dst = %dst, operator = "CoordinatorFinalize", "moving tmp file");
            fs.rename(src, dst).map_err(|err| {
                KiteError::Execution(format!("could not move {src} to {dst}: {err}"))
            })?;
        }
    }

    for tmp_dir in tmp_dirs_to_delete {
        fs.delete(&tmp_dir, true).map_err(|err| {
            KiteError::Execution(format!("failed to delete temporary directory {tmp_dir}: {err}"))
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("{prefix}_{nanos}"));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    fn touch(path: &Path) {
        fs::write(path, b"x").expect("touch");
    }

    fn params(base_dir: &Path, overwrite: bool) -> FinalizeParams {
        FinalizeParams {
            table_name: "t".to_string(),
            base_dir: base_dir.to_string_lossy().into_owned(),
            is_overwrite: overwrite,
        }
    }

    #[test]
    fn overwrite_of_unpartitioned_table_keeps_subdirectories() {
        let root = scratch_dir("kite_finalize_unpart");
        touch(&root.join("a"));
        touch(&root.join("b"));
        fs::create_dir(root.join("sub")).expect("subdir");
        touch(&root.join("sub").join("keep"));
        let tmp = scratch_dir("kite_finalize_tmp");
        touch(&tmp.join("tmp1"));
        touch(&tmp.join("tmp2"));

        let rows = HashMap::from([(String::new(), 10_i64)]);
        let moves = BTreeMap::from([
            (
                tmp.join("tmp1").to_string_lossy().into_owned(),
                root.join("a").to_string_lossy().into_owned(),
            ),
            (
                tmp.join("tmp2").to_string_lossy().into_owned(),
                root.join("c").to_string_lossy().into_owned(),
            ),
            (tmp.to_string_lossy().into_owned(), String::new()),
        ]);

        finalize_insert(&LocalDfs, &params(&root, true), &rows, &moves).expect("finalize");

        assert!(root.join("a").exists());
        assert!(root.join("c").exists());
        assert!(!root.join("b").exists());
        assert!(root.join("sub").join("keep").exists());
        assert!(!tmp.exists());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn overwrite_of_partition_deletes_directory_recursively() {
        let root = scratch_dir("kite_finalize_part");
        let partition = root.join("day=2013-01-01");
        fs::create_dir_all(partition.join("nested")).expect("partition");
        touch(&partition.join("old"));
        touch(&partition.join("nested").join("old2"));

        let rows = HashMap::from([("day=2013-01-01".to_string(), 5_i64)]);
        finalize_insert(&LocalDfs, &params(&root, true), &rows, &BTreeMap::new())
            .expect("finalize");

        assert!(partition.exists());
        assert!(!partition.join("old").exists());
        assert!(!partition.join("nested").exists());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn missing_partition_directory_is_created() {
        let root = scratch_dir("kite_finalize_create");
        let rows = HashMap::from([("day=2013-01-02".to_string(), 1_i64)]);
        finalize_insert(&LocalDfs, &params(&root, false), &rows, &BTreeMap::new())
            .expect("finalize");
        assert!(root.join("day=2013-01-02").exists());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn failed_move_fails_the_query() {
        let root = scratch_dir("kite_finalize_badmove");
        let rows = HashMap::from([(String::new(), 1_i64)]);
        let moves = BTreeMap::from([(
            root.join("does-not-exist").to_string_lossy().into_owned(),
            root.join("dst").to_string_lossy().into_owned(),
        )]);
        let err = finalize_insert(&LocalDfs, &params(&root, false), &rows, &moves)
            .expect_err("move should fail");
        assert!(matches!(err, KiteError::Execution(_)));
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn deleting_a_vanished_path_is_not_an_error() {
        let root = scratch_dir("kite_finalize_enoent");
        LocalDfs
            .delete(root.join("gone").to_string_lossy().as_ref(), true)
            .expect("tolerated");
        fs::remove_dir_all(&root).ok();
    }
}
