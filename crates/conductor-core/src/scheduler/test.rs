//! One unit of validation work and its accumulated errors.

use tracing::warn;

/// What a test instance was scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestScope {
    Global,
    Platform(String),
    Host { platform: String, host: String },
}

/// A single (test name, scope) instance.
///
/// Lifecycle: errors accumulate, then [`mark_executed`] freezes the
/// instance; appends after that point are rejected. The run's exit status
/// is 1 iff at least one executed test carries errors.
///
/// [`mark_executed`]: Test::mark_executed
#[derive(Debug, Clone)]
pub struct Test {
    name: String,
    scope: TestScope,
    errors: Vec<String>,
    executed: bool,
}

impl Test {
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: TestScope::Global,
            errors: Vec::new(),
            executed: false,
        }
    }

    pub fn for_platform(name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: TestScope::Platform(platform.into()),
            errors: Vec::new(),
            executed: false,
        }
    }

    pub fn for_host(
        name: impl Into<String>,
        platform: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            scope: TestScope::Host {
                platform: platform.into(),
                host: host.into(),
            },
            errors: Vec::new(),
            executed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &TestScope {
        &self.scope
    }

    /// Host this instance targets, if host-scoped.
    pub fn host(&self) -> Option<&str> {
        match &self.scope {
            TestScope::Host { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Record an error. Ignored (with a warning) once the test is frozen.
    pub fn error(&mut self, message: impl Into<String>) {
        if self.executed {
            warn!(test = %self.name, "error reported after execution mark; dropping");
            return;
        }
        self.errors.push(message.into());
    }

    /// Freeze the instance; it becomes read-only.
    pub fn mark_executed(&mut self) {
        self.executed = true;
    }

    pub fn executed(&self) -> bool {
        self.executed
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_accumulate_until_executed() {
        let mut test = Test::for_host("hostname", "plat", "n1");
        test.error("first");
        test.error("second");
        assert_eq!(test.errors().len(), 2);
        assert!(!test.passed());

        test.mark_executed();
        test.error("too late");
        assert_eq!(test.errors().len(), 2, "frozen test must stay read-only");
    }

    #[test]
    fn test_scope_accessors() {
        assert_eq!(Test::global("g").host(), None);
        let t = Test::for_host("t", "plat", "n1");
        assert_eq!(t.host(), Some("n1"));
        assert_eq!(
            t.scope(),
            &TestScope::Host {
                platform: "plat".into(),
                host: "n1".into()
            }
        );
    }

    #[test]
    fn test_fresh_test_passes() {
        let mut test = Test::global("g");
        assert!(test.passed());
        test.mark_executed();
        assert!(test.executed());
        assert!(test.passed());
    }
}
