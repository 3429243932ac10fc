// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier selecting one logical journal on a journal node.
/// Multiple journals may coexist on a single node.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct JournalId(String);

impl JournalId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        JournalId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JournalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JournalId {
    fn from(id: &str) -> Self {
        JournalId::new(id)
    }
}
