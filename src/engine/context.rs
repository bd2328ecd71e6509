use crate::template::{collect_files, IgnoreList};
use std::path::Path;

/// Pack `dir` into an uncompressed tar archive for `docker build -`.
///
/// Entries are added in sorted order with the same ignore rules the template
/// hash uses, so the hash describes exactly what gets built.
pub fn pack_build_context(dir: &Path, ignore: &IgnoreList) -> std::io::Result<Vec<u8>> {
    let mut files = Vec::new();
    collect_files(dir, dir, ignore, &mut files)?;
    files.sort();

    let mut builder = tar::Builder::new(Vec::new());
    builder.mode(tar::HeaderMode::Deterministic);
    for rel in &files {
        builder.append_path_with_name(dir.join(rel), rel)?;
    }
    builder.into_inner()
}
