//! Module resolver contract for the Erkao VM.
//!
//! The VM consumes resolution through the [`ModuleResolver`] trait: given
//! the importing file's absolute path and the literal import path, a
//! resolver yields the absolute path of an `.ek` source file, or `None`
//! when the import is unresolvable. Package-spec resolution (bare names
//! with version selectors, resolved against `packages/` directories) lives
//! outside the engine; the shipped [`FsResolver`] covers the file-path
//! subset: literals beginning with `.`, `/` or a drive letter.

use std::path::{Path, PathBuf};

/// Resolves import literals to on-disk module sources.
pub trait ModuleResolver {
    /// Resolves `literal` as imported from `importer`. The returned path
    /// must be absolute and canonical; the VM uses it as the module
    /// registry key.
    fn resolve(&self, importer: &Path, literal: &str) -> Option<PathBuf>;
}

/// The default filesystem resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsResolver;

impl FsResolver {
    fn is_path_literal(literal: &str) -> bool {
        if literal.starts_with('.') || literal.starts_with('/') {
            return true;
        }
        // Windows drive letters: `C:\...` or `C:/...`
        let bytes = literal.as_bytes();
        bytes.len() > 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
    }
}

impl ModuleResolver for FsResolver {
    fn resolve(&self, importer: &Path, literal: &str) -> Option<PathBuf> {
        if !Self::is_path_literal(literal) {
            // Package specs are resolved by the embedding toolchain
            return None;
        }
        let mut candidate = if Path::new(literal).is_absolute() {
            PathBuf::from(literal)
        } else {
            importer.parent()?.join(literal)
        };
        if candidate.extension().is_none() {
            candidate.set_extension("ek");
        }
        std::fs::canonicalize(candidate).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_relative_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let importer = dir.path().join("main.ek");
        let dep = dir.path().join("util.ek");
        fs::write(&importer, "").unwrap();
        fs::write(&dep, "").unwrap();

        let resolver = FsResolver;
        let resolved = resolver.resolve(&importer, "./util.ek").unwrap();
        assert_eq!(resolved, fs::canonicalize(&dep).unwrap());

        // Extension inference
        let resolved = resolver.resolve(&importer, "./util").unwrap();
        assert_eq!(resolved, fs::canonicalize(&dep).unwrap());
    }

    #[test]
    fn test_missing_file_is_unresolvable() {
        let dir = tempfile::tempdir().unwrap();
        let importer = dir.path().join("main.ek");
        fs::write(&importer, "").unwrap();
        assert!(FsResolver.resolve(&importer, "./absent.ek").is_none());
    }

    #[test]
    fn test_package_specs_are_out_of_scope() {
        let dir = tempfile::tempdir().unwrap();
        let importer = dir.path().join("main.ek");
        fs::write(&importer, "").unwrap();
        assert!(FsResolver.resolve(&importer, "strings@^1.2").is_none());
    }
}
