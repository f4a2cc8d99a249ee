//! Unit tests for workspace root confinement and blocklist matching.

use std::path::Path;
use std::sync::Arc;

use acp_broker::workspace::WorkspaceGuard;
use acp_broker::Config;

fn guard_with_root(root: &Path) -> Arc<WorkspaceGuard> {
    let config = Config::default();
    let guard = WorkspaceGuard::new(&config).expect("default blocklist must build");
    guard.set_root(root).expect("set_root on tempdir");
    Arc::new(guard)
}

#[test]
fn resolves_relative_path_inside_workspace() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(temp.path().join("src")).expect("mkdir");
    std::fs::write(temp.path().join("src/lib.rs"), "x").expect("write");
    let guard = guard_with_root(temp.path());

    let resolved = guard
        .resolve_path(Path::new("src/lib.rs"))
        .expect("path inside workspace must resolve");

    let canonical_root = temp.path().canonicalize().expect("canonicalize root");
    assert!(resolved.starts_with(&canonical_root));
    assert!(resolved.ends_with("src/lib.rs"));
}

#[test]
fn fails_without_a_workspace_root() {
    let config = Config::default();
    let guard = WorkspaceGuard::new(&config).expect("guard");

    let err = guard
        .resolve_path(Path::new("anything.txt"))
        .expect_err("no root means no resolution");
    assert!(err.to_string().contains("no workspace set"));
}

#[test]
fn rejects_parent_traversal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let guard = guard_with_root(temp.path());

    let err = guard
        .resolve_path(Path::new("../outside.txt"))
        .expect_err("traversal past the root must fail");
    assert!(err.to_string().contains("escapes workspace root") || err.to_string().contains("failed to resolve"));
}

#[test]
fn rejects_absolute_path_outside_workspace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let outside = tempfile::tempdir().expect("outside dir");
    let target = outside.path().join("secret.txt");
    std::fs::write(&target, "s").expect("write");
    let guard = guard_with_root(temp.path());

    let err = guard
        .resolve_path(&target)
        .expect_err("absolute path outside the root must fail");
    assert!(err.to_string().contains("path escapes workspace root"));
}

#[test]
fn allows_nonexistent_file_in_existing_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let guard = guard_with_root(temp.path());

    let resolved = guard
        .resolve_path(Path::new("new_file.txt"))
        .expect("nonexistent leaf with an existing parent must resolve");
    assert!(resolved.ends_with("new_file.txt"));
}

#[test]
fn rejects_nonexistent_parent_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let guard = guard_with_root(temp.path());

    let err = guard
        .resolve_path(Path::new("missing_dir/new_file.txt"))
        .expect_err("missing parent cannot be resolved");
    assert!(err.to_string().contains("failed to resolve path"));
}

#[test]
fn blocks_env_file_by_basename() {
    let temp = tempfile::tempdir().expect("tempdir");
    let guard = guard_with_root(temp.path());

    let err = guard
        .resolve_path(Path::new(".env"))
        .expect_err(".env is on the default blocklist");
    assert!(err.to_string().contains("blocked by policy"));
}

#[test]
fn blocks_key_material_by_extension() {
    let temp = tempfile::tempdir().expect("tempdir");
    let guard = guard_with_root(temp.path());

    for name in ["server.pem", "deploy.key", "nested/dir/id.key"] {
        if let Some(parent) = Path::new(name).parent() {
            std::fs::create_dir_all(temp.path().join(parent)).expect("mkdir");
        }
        let err = guard
            .resolve_path(Path::new(name))
            .expect_err("key material must be blocked");
        assert!(err.to_string().contains("blocked by policy"), "{name}");
    }
}

#[test]
fn blocks_node_modules_subtree_by_full_path() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(temp.path().join("node_modules/pkg")).expect("mkdir");
    std::fs::write(temp.path().join("node_modules/pkg/index.js"), "x").expect("write");
    let guard = guard_with_root(temp.path());

    let err = guard
        .resolve_path(Path::new("node_modules/pkg/index.js"))
        .expect_err("node_modules contents are blocked");
    assert!(err.to_string().contains("blocked by policy"));
}

#[cfg(unix)]
#[test]
fn rejects_symlink_escaping_the_workspace() {
    use std::os::unix::fs::symlink;

    let workspace = tempfile::tempdir().expect("workspace");
    let outside = tempfile::tempdir().expect("outside");
    let secret = outside.path().join("secret.txt");
    std::fs::write(&secret, "top secret").expect("write secret");
    symlink(&secret, workspace.path().join("sneaky_link")).expect("symlink");

    let guard = guard_with_root(workspace.path());

    let err = guard
        .resolve_path(Path::new("sneaky_link"))
        .expect_err("symlink escape must be rejected");
    assert!(err.to_string().contains("path escapes workspace root"));
}

#[test]
fn set_root_requires_an_existing_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = Config::default();
    let guard = WorkspaceGuard::new(&config).expect("guard");

    let missing = temp.path().join("does-not-exist");
    assert!(guard.set_root(&missing).is_err());

    let file = temp.path().join("file.txt");
    std::fs::write(&file, "x").expect("write");
    assert!(guard.set_root(&file).is_err(), "a file is not a valid root");
}

#[test]
fn chdir_changes_relative_resolution() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(temp.path().join("sub/inner")).expect("mkdir");
    std::fs::write(temp.path().join("sub/inner/a.txt"), "x").expect("write");
    let guard = guard_with_root(temp.path());

    guard.chdir(Path::new("sub")).expect("chdir into sub");
    assert_eq!(guard.cwd(), Path::new("sub").to_path_buf());

    let resolved = guard
        .resolve_path(Path::new("inner/a.txt"))
        .expect("relative path resolves against the new cwd");
    assert!(resolved.ends_with("sub/inner/a.txt"));
}

#[test]
fn chdir_rejects_files_and_escapes() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::write(temp.path().join("plain.txt"), "x").expect("write");
    let guard = guard_with_root(temp.path());

    assert!(guard.chdir(Path::new("plain.txt")).is_err());
    assert!(guard.chdir(Path::new("../..")).is_err());
}
