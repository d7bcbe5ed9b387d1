//! Operations a front-end can dispatch, and the verb each one requires.

use crate::{Result, SpotterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
}

impl std::str::FromStr for Verb {
    type Err = SpotterError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("GET") {
            Ok(Verb::Get)
        } else if s.eq_ignore_ascii_case("POST") {
            Ok(Verb::Post)
        } else {
            Err(SpotterError::Validation(format!("unsupported verb {s:?}")))
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Ingest a batch of observations.
    RecordItems,
    ItemExists,
    ItemsExist,
    /// Filter query over stored entities.
    Query,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::RecordItems,
        Operation::ItemExists,
        Operation::ItemsExist,
        Operation::Query,
    ];

    pub fn action(self) -> &'static str {
        match self {
            Operation::RecordItems => "record_items",
            Operation::ItemExists => "item_exists",
            Operation::ItemsExist => "items_exist",
            Operation::Query => "query",
        }
    }

    pub fn from_action(action: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.action() == action)
    }

    pub fn required_verb(self) -> Verb {
        match self {
            Operation::RecordItems | Operation::ItemsExist => Verb::Post,
            Operation::ItemExists | Operation::Query => Verb::Get,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_round_trip() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_action(op.action()), Some(op));
        }
        assert_eq!(Operation::from_action("drop_everything"), None);
    }

    #[test]
    fn writes_and_batch_lookups_are_posts() {
        assert_eq!(Operation::RecordItems.required_verb(), Verb::Post);
        assert_eq!(Operation::ItemsExist.required_verb(), Verb::Post);
        assert_eq!(Operation::ItemExists.required_verb(), Verb::Get);
        assert_eq!(Operation::Query.required_verb(), Verb::Get);
    }

    #[test]
    fn verbs_parse_case_insensitively() {
        assert_eq!("get".parse::<Verb>().unwrap(), Verb::Get);
        assert_eq!("POST".parse::<Verb>().unwrap(), Verb::Post);
        assert!("DELETE".parse::<Verb>().unwrap_err().is_validation());
    }
}
