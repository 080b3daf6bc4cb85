pub mod account;
pub mod blob;
pub mod manifest;
pub mod peer;
pub mod policies;
pub mod repo;

pub use account::Account;
pub use blob::{Blob, BlobMount, PendingBlob, UnknownBlob, Upload};
pub use manifest::{
    Manifest, ManifestBlobRef, ManifestManifestRef, Tag, UnknownManifest, VulnStatus,
};
pub use peer::{Peer, Quota};
pub use policies::{GcPolicy, Platform, PlatformFilter, RbacPermission, RbacPolicy};
pub use repo::Repository;

use once_cell::sync::Lazy;
use regex::Regex;

/// Account names become DNS labels and storage container names, so the
/// grammar is stricter than the repository grammar.
pub fn is_valid_account_name(name: &str) -> bool {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").unwrap());
    name.len() <= 48 && RE.is_match(name)
}

/// Repository names follow the registry grammar: lowercase path components
/// separated by slashes, no tag or digest suffix.
pub fn is_valid_repository_name(name: &str) -> bool {
    static RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$").unwrap()
    });
    !name.is_empty() && name.len() <= 256 && RE.is_match(name)
}

/// Tag grammar per the distribution spec.
pub fn is_valid_tag_name(name: &str) -> bool {
    static RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap());
    RE.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_name_grammar() {
        assert!(is_valid_account_name("acc1"));
        assert!(is_valid_account_name("0-team-a"));
        assert!(!is_valid_account_name("-leading-dash"));
        assert!(!is_valid_account_name("Upper"));
        assert!(!is_valid_account_name(&"a".repeat(49)));
        assert!(!is_valid_account_name(""));
    }

    #[test]
    fn repository_name_grammar() {
        assert!(is_valid_repository_name("foo"));
        assert!(is_valid_repository_name("foo/bar-baz/qux.v2"));
        assert!(!is_valid_repository_name("foo//bar"));
        assert!(!is_valid_repository_name("/foo"));
        assert!(!is_valid_repository_name("foo/"));
        assert!(!is_valid_repository_name("Foo"));
        assert!(!is_valid_repository_name("foo:latest"));
    }

    #[test]
    fn tag_name_grammar() {
        assert!(is_valid_tag_name("latest"));
        assert!(is_valid_tag_name("v1.2.3_rc1"));
        assert!(!is_valid_tag_name(".hidden"));
        assert!(!is_valid_tag_name(&"t".repeat(129)));
    }
}
