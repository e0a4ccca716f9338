// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Append-only issue log attached to each transaction.
//!
//! Issues record disputes as well as routine technical failures such as a
//! charger that did not start. Entries are never edited or removed.

use crate::base::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub description: String,
    pub reported_by: UserId,
    pub timestamp: DateTime<Utc>,
}

impl Issue {
    pub fn new(description: impl Into<String>, reported_by: UserId) -> Self {
        Self {
            description: description.into(),
            reported_by,
            timestamp: Utc::now(),
        }
    }
}

/// Ordered issue list. Exposes no way to mutate or drop existing entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueLog(Vec<Issue>);

impl IssueLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, issue: Issue) {
        self.0.push(issue);
    }

    /// Returns `true` if `issue` repeats the latest entry from the same reporter.
    ///
    /// Used to absorb a second delivery of the same chat action.
    pub fn repeats_last(&self, issue: &Issue) -> bool {
        self.0
            .last()
            .is_some_and(|last| last.reported_by == issue.reported_by && last.description == issue.description)
    }

    pub fn last(&self) -> Option<&Issue> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Issue> {
        self.0.iter()
    }

    pub fn reported_by(&self, user: UserId) -> impl Iterator<Item = &Issue> {
        self.0.iter().filter(move |issue| issue.reported_by == user)
    }
}
