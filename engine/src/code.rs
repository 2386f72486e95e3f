//! Codes: scoped, reservable business keys.
//!
//! The [`CodeRegistry`] is the hub-side arbiter. A code is reserved by at
//! most one briefcase at a time and becomes `Used` once a changeset that
//! relies on it is pushed.

use crate::{error::Result, BriefcaseId, CodeSpecId, Error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A value reservation scoped by code spec and scope element.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Code {
    pub spec: CodeSpecId,
    pub scope: String,
    pub value: String,
}

impl Code {
    pub fn new(
        spec: impl Into<CodeSpecId>,
        scope: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            spec: spec.into(),
            scope: scope.into(),
            value: value.into(),
        }
    }

    /// The empty code. Elements carrying it need no reservation.
    pub fn empty() -> Self {
        Self::new("", "", "")
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl Default for Code {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.spec, self.scope, self.value)
    }
}

/// State of a code on the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CodeState {
    Available,
    Reserved,
    Used,
}

/// A code together with its state and owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeReservation {
    pub code: Code,
    pub state: CodeState,
    pub briefcase_id: BriefcaseId,
}

/// Hub-side table of code reservations for one iModel.
#[derive(Debug, Clone, Default)]
pub struct CodeRegistry {
    codes: BTreeMap<Code, CodeReservation>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// State of a code. Unknown codes are available.
    pub fn state(&self, code: &Code) -> CodeState {
        self.codes
            .get(code)
            .map(|r| r.state)
            .unwrap_or(CodeState::Available)
    }

    pub fn get(&self, code: &Code) -> Option<&CodeReservation> {
        self.codes.get(code)
    }

    /// Reserve one code for a briefcase.
    ///
    /// Re-reserving a code the briefcase already holds succeeds.
    pub fn reserve(&mut self, briefcase_id: BriefcaseId, code: &Code) -> Result<()> {
        if code.is_empty() {
            return Ok(());
        }
        match self.codes.get(code) {
            Some(r) if r.state == CodeState::Used => Err(Error::CodeAlreadyUsed(code.to_string())),
            Some(r) if r.briefcase_id != briefcase_id => Err(Error::CodeReservedByAnotherBriefcase {
                code: code.to_string(),
                owner: r.briefcase_id,
            }),
            _ => {
                self.codes.insert(
                    code.clone(),
                    CodeReservation {
                        code: code.clone(),
                        state: CodeState::Reserved,
                        briefcase_id,
                    },
                );
                Ok(())
            }
        }
    }

    /// Reserve a batch, granting what is available.
    ///
    /// Returns the codes that could not be reserved.
    pub fn reserve_all(&mut self, briefcase_id: BriefcaseId, codes: &[Code]) -> Vec<Code> {
        codes
            .iter()
            .filter(|code| self.reserve(briefcase_id, code).is_err())
            .cloned()
            .collect()
    }

    /// Codes currently reserved (not yet used) by a briefcase.
    pub fn reserved_by(&self, briefcase_id: BriefcaseId) -> Vec<Code> {
        self.codes
            .values()
            .filter(|r| r.briefcase_id == briefcase_id && r.state == CodeState::Reserved)
            .map(|r| r.code.clone())
            .collect()
    }

    /// Mark codes as used by a pushed changeset.
    ///
    /// Codes reserved by another briefcase are left untouched.
    pub fn mark_used(&mut self, briefcase_id: BriefcaseId, codes: &[Code]) -> usize {
        let mut marked = 0;
        for code in codes.iter().filter(|c| !c.is_empty()) {
            let entry = self.codes.entry(code.clone()).or_insert(CodeReservation {
                code: code.clone(),
                state: CodeState::Reserved,
                briefcase_id,
            });
            if entry.briefcase_id == briefcase_id && entry.state == CodeState::Reserved {
                entry.state = CodeState::Used;
                marked += 1;
            }
        }
        marked
    }

    /// Drop every unused reservation held by a briefcase.
    pub fn release(&mut self, briefcase_id: BriefcaseId) -> usize {
        let before = self.codes.len();
        self.codes
            .retain(|_, r| !(r.briefcase_id == briefcase_id && r.state == CodeState::Reserved));
        before - self.codes.len()
    }
}
