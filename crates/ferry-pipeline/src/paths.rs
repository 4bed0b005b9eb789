//! Local and remote path building.
//!
//! A local path is built by walking a list of directories from the most to
//! the least specific. *Leaf* directories override each other: the first
//! non-empty one wins. *Branch* directories are roots the path built so far
//! is resolved against. An absolute directory ends the walk.
//!
//! ```text
//!  gateway home                                 less specific
//!     ├──────────────────────┐
//!  server root*        default in/out/tmp dir
//!     ├──────────────┐
//!  rule dir    server in/out/tmp dir*           more specific
//!
//!  * server-side transfers only
//! ```

use ferry_core::{Transfer, TransferContext};
use std::path::{Path, PathBuf};

/// Suffix of files being received
pub const PART_SUFFIX: &str = ".part";

#[derive(Debug, Clone, Copy)]
enum Dir<'a> {
    Leaf(&'a Path),
    Branch(&'a Path),
}

fn leaf(dir: &str) -> Dir<'_> {
    Dir::Leaf(Path::new(dir))
}

fn branch(dir: &Path) -> Dir<'_> {
    Dir::Branch(dir)
}

fn get_path(file: &str, dirs: &[Dir<'_>]) -> PathBuf {
    let mut path = PathBuf::from(file);
    if path.is_absolute() {
        return path;
    }

    let mut leaf_found = false;
    for dir in dirs {
        let (dir, is_leaf) = match *dir {
            Dir::Leaf(d) => (d, true),
            Dir::Branch(d) => (d, false),
        };
        if dir.as_os_str().is_empty() || (is_leaf && leaf_found) {
            continue;
        }

        path = dir.join(path);
        if dir.is_absolute() {
            break;
        }
        leaf_found |= is_leaf;
    }

    path
}

/// Local file name and remote file name of a transfer. An empty destination
/// name defaults to the source name.
fn filenames(trans: &Transfer) -> (&str, &str) {
    let src = trans.src_filename.as_str();
    let dest = if trans.dest_filename.is_empty() {
        src
    } else {
        trans.dest_filename.as_str()
    };
    (src, dest)
}

/// Local path of the transfer's file. For receive transfers this is the
/// temporary location, without the [`PART_SUFFIX`].
#[must_use]
pub fn local_path(ctx: &TransferContext, trans: &Transfer) -> PathBuf {
    let (src, dest) = filenames(trans);
    let rule = &ctx.rule;
    let paths = &ctx.paths;
    let home = branch(&paths.gateway_home);

    if trans.is_server() {
        let agent = ctx.local_agent.clone().unwrap_or_default();
        if rule.is_send {
            get_path(
                src,
                &[
                    leaf(&rule.local_dir),
                    leaf(&agent.send_dir),
                    branch(Path::new(&agent.root_dir)),
                    leaf(&paths.default_out_dir),
                    home,
                ],
            )
        } else {
            get_path(
                dest,
                &[
                    leaf(&rule.tmp_local_rcv_dir),
                    leaf(&rule.local_dir),
                    leaf(&agent.tmp_receive_dir),
                    leaf(&agent.receive_dir),
                    branch(Path::new(&agent.root_dir)),
                    leaf(&paths.default_tmp_dir),
                    leaf(&paths.default_in_dir),
                    home,
                ],
            )
        }
    } else if rule.is_send {
        get_path(src, &[leaf(&rule.local_dir), leaf(&paths.default_out_dir), home])
    } else {
        get_path(
            dest,
            &[
                leaf(&rule.tmp_local_rcv_dir),
                leaf(&rule.local_dir),
                leaf(&paths.default_tmp_dir),
                leaf(&paths.default_in_dir),
                home,
            ],
        )
    }
}

/// Final destination of a received file: the receive chain without the
/// temporary directories.
#[must_use]
pub fn final_path(ctx: &TransferContext, trans: &Transfer) -> PathBuf {
    let (_, dest) = filenames(trans);
    let rule = &ctx.rule;
    let paths = &ctx.paths;
    let home = branch(&paths.gateway_home);

    if trans.is_server() {
        let agent = ctx.local_agent.clone().unwrap_or_default();
        get_path(
            dest,
            &[
                leaf(&rule.local_dir),
                leaf(&agent.receive_dir),
                branch(Path::new(&agent.root_dir)),
                leaf(&paths.default_in_dir),
                home,
            ],
        )
    } else {
        get_path(
            dest,
            &[leaf(&rule.local_dir), leaf(&paths.default_in_dir), home],
        )
    }
}

/// Remote path of a client transfer: the rule's remote directory followed by
/// the remote file name.
#[must_use]
pub fn remote_path(ctx: &TransferContext, trans: &Transfer) -> String {
    let (src, dest) = filenames(trans);
    let file = if ctx.rule.is_send { dest } else { src };
    let dir = ctx.rule.remote_dir.trim_end_matches('/');

    if dir.is_empty() {
        file.to_string()
    } else {
        format!("{dir}/{file}")
    }
}

/// Fill the transfer's local and remote paths when they are not set yet
pub fn set_file_paths(ctx: &TransferContext, trans: &mut Transfer) {
    if !trans.is_server() && trans.remote_path.is_empty() {
        trans.remote_path = remote_path(ctx, trans);
    }
    if trans.local_path.as_os_str().is_empty() {
        trans.local_path = local_path(ctx, trans);
    }
}

/// Append [`PART_SUFFIX`] to a path
#[must_use]
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}
