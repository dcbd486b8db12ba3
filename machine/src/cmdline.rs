//! Ordered hypervisor invocation.

use serde::Serialize;

/// Executable followed by its arguments, in order.
///
/// Rebuilt on every start and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandLine {
    tokens: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            tokens: vec![program.into()],
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.tokens.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens.extend(args.into_iter().map(Into::into));
        self
    }

    /// `flag value` pair.
    pub fn opt(&mut self, flag: &str, value: impl Into<String>) -> &mut Self {
        self.tokens.push(flag.to_string());
        self.tokens.push(value.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.tokens[0]
    }

    pub fn arguments(&self) -> &[String] {
        &self.tokens[1..]
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Values following every occurrence of `flag`.
    pub fn values_of<'a>(&'a self, flag: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tokens
            .windows(2)
            .filter(move |w| w[0] == flag)
            .map(|w| w[1].as_str())
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tokens.join(" "))
    }
}
