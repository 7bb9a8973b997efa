//! Package spec argument parsing.
//!
//! Parses install arguments like:
//! - `react`
//! - `react@18.2.0`
//! - `react@^18.0.0`
//! - `@types/node`
//! - `@types/node@^20`

use crate::error::EngineError;

/// A parsed package specification argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    /// Full package name (e.g., "@scope/name" or "name").
    pub name: String,
    /// Version specifier (None means latest).
    pub range: Option<String>,
}

impl PackageSpec {
    /// Parse a package specification string.
    ///
    /// # Errors
    /// Returns an error if the spec is invalid.
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        let input = input.trim();

        if input.is_empty() {
            return Err(EngineError::spec_invalid("empty package spec"));
        }

        // For scoped packages the leading @ is part of the name, so the
        // version delimiter is the first @ after position zero.
        let at_pos = if let Some(rest) = input.strip_prefix('@') {
            rest.find('@').map(|p| p + 1)
        } else {
            input.find('@')
        };

        let (name, range) = match at_pos {
            Some(pos) => {
                let range = &input[pos + 1..];
                if range.is_empty() {
                    return Err(EngineError::spec_invalid(format!(
                        "empty version range in '{input}'"
                    )));
                }
                (&input[..pos], Some(range.to_string()))
            }
            None => (input, None),
        };

        validate_name(name)?;

        Ok(Self {
            name: name.to_string(),
            range,
        })
    }

    /// The specifier to hand to the resolver; defaults to `latest`.
    #[must_use]
    pub fn range_or_latest(&self) -> &str {
        self.range.as_deref().unwrap_or("latest")
    }
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::spec_invalid("empty package name"));
    }

    if let Some(rest) = name.strip_prefix('@') {
        let Some((scope, pkg)) = rest.split_once('/') else {
            return Err(EngineError::spec_invalid(format!(
                "invalid scoped package: missing '/' in '{name}'"
            )));
        };
        if scope.is_empty() || pkg.is_empty() {
            return Err(EngineError::spec_invalid(format!(
                "invalid scoped package name '{name}'"
            )));
        }
        return Ok(());
    }

    for c in name.chars() {
        if !c.is_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(EngineError::spec_invalid(format!(
                "invalid character '{c}' in package name '{name}'"
            )));
        }
    }

    Ok(())
}
