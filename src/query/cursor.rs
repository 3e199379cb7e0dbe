use super::QueryError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

/// Opaque pagination cursor. Callers only ever echo one back from a
/// prior response.
///
/// `position` is a record-ordinal boundary: the first ordinal to
/// consider when moving forward, the exclusive upper bound when moving
/// backward. `filter_hash` pins the cursor to the filter set it was
/// minted under; presenting it with different filters is an error, not a
/// silent restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCursor {
    pub position: u64,
    pub direction: Direction,
    pub filter_hash: u64,
}

impl QueryCursor {
    /// Checks the cursor against the current request's filter
    /// fingerprint and the row store bounds. The position integer is
    /// never trusted as-is.
    pub fn validate(
        &self,
        fingerprint: u64,
        direction: Direction,
        total_rows: u64,
    ) -> Result<(), QueryError> {
        if self.filter_hash != fingerprint {
            return Err(QueryError::CursorInvalid("Filter changed".into()));
        }
        if self.direction != direction {
            return Err(QueryError::CursorInvalid(
                "cursor direction does not match request".into(),
            ));
        }
        if self.position > total_rows {
            return Err(QueryError::CursorInvalid(format!(
                "position {} out of range ({} rows)",
                self.position, total_rows
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(position: u64, hash: u64) -> QueryCursor {
        QueryCursor {
            position,
            direction: Direction::Forward,
            filter_hash: hash,
        }
    }

    #[test]
    fn accepts_matching_fingerprint_in_bounds() {
        assert!(cursor(5, 42).validate(42, Direction::Forward, 10).is_ok());
        // The end boundary itself is a valid backward anchor.
        assert!(QueryCursor {
            position: 10,
            direction: Direction::Backward,
            filter_hash: 42
        }
        .validate(42, Direction::Backward, 10)
        .is_ok());
    }

    #[test]
    fn rejects_changed_filter() {
        let err = cursor(5, 42).validate(43, Direction::Forward, 10).unwrap_err();
        match err {
            QueryError::CursorInvalid(reason) => assert_eq!(reason, "Filter changed"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_direction_mismatch() {
        assert!(matches!(
            cursor(5, 42).validate(42, Direction::Backward, 10),
            Err(QueryError::CursorInvalid(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_position() {
        assert!(matches!(
            cursor(11, 42).validate(42, Direction::Forward, 10),
            Err(QueryError::CursorInvalid(_))
        ));
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_string(&cursor(3, 7)).unwrap();
        assert!(json.contains("\"filterHash\":7"));
        assert!(json.contains("\"direction\":\"forward\""));
    }
}
