//! Cursor pagination for listings
//!
//! All listings are in time order. A cursor anchors at the last returned
//! item as a `(order, created_at, id)` triple; continuing from it returns
//! only items strictly past the anchor in the listing direction, no
//! matter what was inserted in between. A page that reaches the end
//! (`has_more = false`) still carries the cursor so a client can resume
//! after new inserts.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Listing direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl std::fmt::Display for SortOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asc => write!(f, "asc"),
            Self::Desc => write!(f, "desc"),
        }
    }
}

/// Opaque, monotonic listing cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub order: SortOrder,
    pub created_at: DateTime<Utc>,
    pub anchor: String,
}

impl Cursor {
    /// Encode to the opaque wire form
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}",
            self.order,
            self.created_at.timestamp_micros(),
            self.anchor
        )
    }

    /// Decode from the opaque wire form
    pub fn decode(raw: &str) -> Result<Self, CursorError> {
        let mut parts = raw.splitn(3, ':');
        let order = match parts.next() {
            Some("asc") => SortOrder::Asc,
            Some("desc") => SortOrder::Desc,
            _ => return Err(CursorError::Malformed(raw.to_string())),
        };
        let micros: i64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| CursorError::Malformed(raw.to_string()))?;
        let created_at = Utc
            .timestamp_micros(micros)
            .single()
            .ok_or_else(|| CursorError::Malformed(raw.to_string()))?;
        let anchor = parts
            .next()
            .ok_or_else(|| CursorError::Malformed(raw.to_string()))?
            .to_string();

        Ok(Self {
            order,
            created_at,
            anchor,
        })
    }

    /// Whether an item keyed `(created_at, id)` lies strictly past this
    /// anchor in the cursor's direction.
    pub fn admits(&self, created_at: DateTime<Utc>, id: &str) -> bool {
        let item = (created_at.timestamp_micros(), id);
        let anchor = (self.created_at.timestamp_micros(), self.anchor.as_str());
        match self.order {
            SortOrder::Asc => item > anchor,
            SortOrder::Desc => item < anchor,
        }
    }
}

/// Malformed cursor input
#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("malformed cursor: {0}")]
    Malformed(String),
}

/// Page request: limit plus optional continuation cursor
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub limit: Option<usize>,
    pub cursor: Option<Cursor>,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).max(1)
    }
}

/// One page of a listing
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub cursor: Option<Cursor>,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            data: self.data.into_iter().map(f).collect(),
            cursor: self.cursor,
            has_more: self.has_more,
        }
    }
}

/// Paginate `items`, already sorted in `order` by `(created_at, id)`.
///
/// Shared by every backend so the cursor contract is identical across
/// them: strictly-past-anchor filtering, limit+1 probing for `has_more`,
/// and a cursor that is still set when the page reaches the end. An empty
/// continuation echoes the incoming cursor.
pub fn paginate<T>(
    items: Vec<T>,
    order: SortOrder,
    req: &PageRequest,
    key: impl Fn(&T) -> (DateTime<Utc>, String),
) -> Page<T> {
    let limit = req.limit();

    let mut admitted: Vec<T> = match &req.cursor {
        Some(cursor) => items
            .into_iter()
            .filter(|item| {
                let (created_at, id) = key(item);
                cursor.admits(created_at, &id)
            })
            .collect(),
        None => items,
    };

    let has_more = admitted.len() > limit;
    admitted.truncate(limit);

    let cursor = match admitted.last() {
        Some(last) => {
            let (created_at, anchor) = key(last);
            Some(Cursor {
                order,
                created_at,
                anchor,
            })
        }
        None => req.cursor.clone(),
    };

    Page {
        data: admitted,
        cursor,
        has_more,
    }
}
