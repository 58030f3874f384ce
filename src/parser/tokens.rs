//! Token cursor over a wire-format DAG command.
//!
//! Keywords are matched case-insensitively, mirroring the original's
//! `strcasecmp`-based dispatch (`original_source/src/DAG/dag_parser.c`,
//! `original_source/src/command_parser.c`).

use crate::error::DagError;

pub const CLAUSE_SEPARATOR: &str = "|>";

pub struct Cursor<'a> {
    tokens: &'a [String],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(tokens: &'a [String]) -> Self {
        Cursor { tokens, pos: 0 }
    }

    pub fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(|s| s.as_str())
    }

    fn is_keyword(tok: &str, keyword: &str) -> bool {
        tok.eq_ignore_ascii_case(keyword)
    }

    /// Consume and return true if the next token matches `keyword`
    /// (case-insensitive); otherwise leave the cursor untouched.
    pub fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().map(|t| Self::is_keyword(t, keyword)).unwrap_or(false) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn take_token(&mut self) -> Result<String, DagError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| DagError::Parse("unexpected end of command".to_string()))?;
        self.pos += 1;
        Ok(tok)
    }

    pub fn take_usize(&mut self) -> Result<usize, DagError> {
        let tok = self.take_token()?;
        tok.parse::<usize>()
            .map_err(|_| DagError::Parse(format!("expected an integer, got {tok}")))
    }

    pub fn take_u64(&mut self) -> Result<u64, DagError> {
        let tok = self.take_token()?;
        tok.parse::<u64>()
            .map_err(|_| DagError::Parse(format!("expected an integer, got {tok}")))
    }

    /// Split everything left in the cursor into pipe-delimited op clauses.
    pub fn remaining_clauses(&mut self) -> Result<Vec<Vec<String>>, DagError> {
        let rest = &self.tokens[self.pos..];
        self.pos = self.tokens.len();
        let mut clauses: Vec<Vec<String>> = vec![Vec::new()];
        for tok in rest {
            if tok == CLAUSE_SEPARATOR {
                clauses.push(Vec::new());
            } else {
                clauses.last_mut().unwrap().push(tok.clone());
            }
        }
        if clauses.iter().any(|c| c.is_empty()) {
            return Err(DagError::Parse("empty op clause".to_string()));
        }
        Ok(clauses)
    }
}

/// Split one op clause's tokens at the first occurrence of `keyword`,
/// returning the tokens before it and everything from `keyword` onward
/// (keyword included). Used to locate `INPUTS`/`OUTPUTS` boundaries.
pub fn split_at_keyword<'a>(tokens: &'a [String], keyword: &str) -> Option<(&'a [String], &'a [String])> {
    tokens
        .iter()
        .position(|t| t.eq_ignore_ascii_case(keyword))
        .map(|idx| (&tokens[..idx], &tokens[idx..]))
}
