use serde::{Deserialize, Serialize};

/// Transfer rule: direction and directories of the transfers run under it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rule {
    /// Identifier
    pub id: i64,
    /// Unique name (per direction)
    pub name: String,
    /// True for rules sending files to the partner
    pub is_send: bool,
    /// Local directory of the files
    #[serde(default)]
    pub local_dir: String,
    /// Remote directory of the files
    #[serde(default)]
    pub remote_dir: String,
    /// Local directory receiving the temporary files
    #[serde(default)]
    pub tmp_local_rcv_dir: String,
}

impl Rule {
    /// Direction as a label
    #[must_use]
    pub fn direction(&self) -> &'static str {
        if self.is_send { "send" } else { "receive" }
    }
}
