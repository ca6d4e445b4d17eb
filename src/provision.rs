//! Hands a reachable instance over to `ansible-playbook`.

use std::ffi::OsString;

use camino::Utf8Path;
use tracing::info;

use crate::command::{CommandError, CommandRunner, run_checked};

/// Extra variable carrying the target address; playbooks use
/// `hosts: "{{ h }}"`.
pub const HOST_VARIABLE: &str = "h";

/// Flag requesting privilege escalation on the target.
pub const ESCALATION_FLAG: &str = "--become";

/// Builds the arguments of a playbook run against `address`.
#[must_use]
pub fn playbook_args(playbook: &Utf8Path, address: &str, escalate: bool) -> Vec<OsString> {
    let mut args = vec![
        OsString::from(playbook.as_str()),
        OsString::from("-e"),
        OsString::from(format!("{HOST_VARIABLE}={address}")),
    ];
    if escalate {
        args.push(OsString::from(ESCALATION_FLAG));
    }
    args
}

/// Runs playbooks through a [`CommandRunner`].
#[derive(Clone, Debug)]
pub struct PlaybookRunner<R> {
    runner: R,
    program: String,
}

impl<R: CommandRunner> PlaybookRunner<R> {
    /// Creates a runner invoking `program`.
    #[must_use]
    pub fn new(runner: R, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    /// Runs `--syntax-check` on the playbook.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when the check fails.
    pub fn syntax_check(&self, playbook: &Utf8Path) -> Result<(), CommandError> {
        let args = [
            OsString::from("--syntax-check"),
            OsString::from(playbook.as_str()),
        ];
        run_checked(&self.runner, &self.program, &args).map(drop)
    }

    /// Applies the playbook to `address`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when the playbook run fails.
    pub fn run(&self, playbook: &Utf8Path, address: &str, escalate: bool) -> Result<(), CommandError> {
        info!(%playbook, address, escalate, "instance ready, running playbook");
        let args = playbook_args(playbook, address, escalate);
        run_checked(&self.runner, &self.program, &args).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::rstest;

    #[rstest]
    #[case(true, "ansible-playbook site.yml -e h=198.51.100.4 --become")]
    #[case(false, "ansible-playbook site.yml -e h=198.51.100.4")]
    fn run_adds_escalation_for_non_root_users(#[case] escalate: bool, #[case] expected: &str) {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let playbooks = PlaybookRunner::new(runner.clone(), "ansible-playbook");

        playbooks
            .run(Utf8Path::new("site.yml"), "198.51.100.4", escalate)
            .expect("playbook succeeds");

        let invocations = runner.invocations();
        assert_eq!(
            invocations.first().map(crate::test_support::CommandInvocation::command_string),
            Some(String::from(expected))
        );
    }

    #[rstest]
    fn failed_syntax_check_is_an_error() {
        let runner = ScriptedRunner::new();
        runner.push_exit_code(4);
        let playbooks = PlaybookRunner::new(runner, "ansible-playbook");

        let err = playbooks
            .syntax_check(Utf8Path::new("broken.yml"))
            .expect_err("syntax check fails");

        assert!(matches!(
            err,
            CommandError::Failed { ref command, status: Some(4), .. }
                if command == "ansible-playbook --syntax-check broken.yml"
        ));
    }
}
