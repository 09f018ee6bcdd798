//! Channel vocabulary shared by the transport, the subscription manager and
//! the relay: names, delivery modes, CDC bindings and the status lifecycle.
//!
//! ```text
//!          open            ack
//!  Idle ─────────► Connecting ─────► Subscribed ──────┐ teardown
//!   ▲                  │  │              │   │        ▼
//!   │                  │  └──────────────┼───┼──►  Closed
//!   │  teardown        ▼                 ▼   ▼
//!   └───────────── Error / TimedOut ◄────┘ (transport failure)
//! ```
//!
//! `Closed` is only ever reached deliberately; failures never end there.

use fleet_model::TableName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

/// Name of an independently lifecycled subscription endpoint (also the
/// relay topic).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for ChannelName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl Borrow<str> for ChannelName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle for one opening of a channel. A resubscription of the same
/// channel gets a new handle, so events for a torn-down handle are
/// recognisably stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelHandle(pub u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which delivery modes a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeliveryModes {
    #[serde(default)]
    pub cdc: bool,
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default)]
    pub presence: bool,
}

impl DeliveryModes {
    pub const ALL: DeliveryModes = DeliveryModes {
        cdc: true,
        broadcast: true,
        presence: true,
    };
    pub const CDC: DeliveryModes = DeliveryModes {
        cdc: true,
        broadcast: false,
        presence: false,
    };
    pub const PRESENCE: DeliveryModes = DeliveryModes {
        cdc: false,
        broadcast: false,
        presence: true,
    };
    pub const BROADCAST: DeliveryModes = DeliveryModes {
        cdc: false,
        broadcast: true,
        presence: false,
    };
}

/// Connection status of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Idle,
    Connecting,
    Subscribed,
    Error,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    /// Transport-level failure (eligible for reconnection).
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::TimedOut)
    }

    pub fn can_transition_to(self, next: ChannelStatus) -> bool {
        use ChannelStatus::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Closed)
                | (Connecting, Subscribed)
                | (Connecting, Error)
                | (Connecting, TimedOut)
                | (Connecting, Closed)
                | (Subscribed, Error)
                | (Subscribed, TimedOut)
                | (Subscribed, Closed)
                | (Error, Idle)
                | (Error, Closed)
                | (TimedOut, Idle)
                | (TimedOut, Closed)
        )
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Error => "error",
            Self::TimedOut => "timed_out",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Row filter on a CDC binding, in the `column=eq.value` /
/// `column=in.(a,b)` notation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RowFilter {
    Eq { column: String, value: String },
    In { column: String, values: Vec<String> },
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn any_of<I, S>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Eq { column, .. } | Self::In { column, .. } => column,
        }
    }

    /// Does a row object satisfy the filter? Non-scalar or missing columns
    /// never match.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(actual) = row.get(self.column()).and_then(scalar_text) else {
            return false;
        };
        match self {
            Self::Eq { value, .. } => actual == *value,
            Self::In { values, .. } => values.iter().any(|v| *v == actual),
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq { column, value } => write!(f, "{column}=eq.{value}"),
            Self::In { column, values } => write!(f, "{column}=in.({})", values.join(",")),
        }
    }
}

impl FromStr for RowFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("filter `{s}` has no `=`"))?;
        if column.is_empty() {
            return Err(format!("filter `{s}` has no column"));
        }
        if let Some(value) = rest.strip_prefix("eq.") {
            return Ok(Self::eq(column, value));
        }
        if let Some(list) = rest.strip_prefix("in.") {
            let inner = list
                .strip_prefix('(')
                .and_then(|l| l.strip_suffix(')'))
                .ok_or_else(|| format!("filter `{s}` has a malformed list"))?;
            let values = inner
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>();
            return Ok(Self::In {
                column: column.to_string(),
                values,
            });
        }
        Err(format!("filter `{s}` uses an unsupported operator"))
    }
}

/// CDC scope: one table, optionally narrowed by a row filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdcBinding {
    pub table: TableName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<RowFilter>,
}

impl CdcBinding {
    pub fn table(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            filter: None,
        }
    }

    pub fn filtered(table: impl Into<TableName>, filter: RowFilter) -> Self {
        Self {
            table: table.into(),
            filter: Some(filter),
        }
    }

    /// Whether a change on `table` touching `row` falls in this binding.
    /// A missing row only matches unfiltered bindings.
    pub fn matches(&self, table: &str, row: Option<&Value>) -> bool {
        if self.table.as_str() != table {
            return false;
        }
        match (&self.filter, row) {
            (None, _) => true,
            (Some(filter), Some(row)) => filter.matches(row),
            (Some(_), None) => false,
        }
    }
}

/// Everything needed to open a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: ChannelName,
    pub modes: DeliveryModes,
    #[serde(default)]
    pub bindings: Vec<CdcBinding>,
}

impl ChannelSpec {
    pub fn new(name: impl Into<ChannelName>, modes: DeliveryModes) -> Self {
        Self {
            name: name.into(),
            modes,
            bindings: Vec::new(),
        }
    }

    pub fn with_binding(mut self, binding: CdcBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Tables this channel feeds into the cache.
    pub fn tables(&self) -> Vec<TableName> {
        let mut tables: Vec<TableName> = Vec::new();
        for binding in &self.bindings {
            if !tables.contains(&binding.table) {
                tables.push(binding.table.clone());
            }
        }
        tables
    }
}
