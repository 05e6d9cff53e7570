use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityKind;

/// Derived status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed)
    }
}

/// Raw report from the transport for one activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Install {
        /// Captured output of the pre-check query, `None` when none ran.
        pre_check_output: Option<String>,
        install_exit_code: Option<i32>,
        install_output: Option<String>,
        post_install_exit_code: Option<i32>,
        post_install_output: Option<String>,
    },
    Uninstall {
        exit_code: Option<i32>,
        output: Option<String>,
    },
    Script {
        exit_code: Option<i32>,
        output: Option<String>,
    },
    Command {
        acknowledged: bool,
        error: Option<String>,
    },
}

impl ExecutionOutcome {
    pub fn installed(exit_code: i32) -> Self {
        ExecutionOutcome::Install {
            pre_check_output: None,
            install_exit_code: Some(exit_code),
            install_output: None,
            post_install_exit_code: None,
            post_install_output: None,
        }
    }

    pub fn uninstalled(exit_code: i32) -> Self {
        ExecutionOutcome::Uninstall {
            exit_code: Some(exit_code),
            output: None,
        }
    }

    pub fn script(exit_code: i32, output: impl Into<String>) -> Self {
        ExecutionOutcome::Script {
            exit_code: Some(exit_code),
            output: Some(output.into()),
        }
    }

    pub fn acknowledged() -> Self {
        ExecutionOutcome::Command {
            acknowledged: true,
            error: None,
        }
    }

    pub fn command_error(error: impl Into<String>) -> Self {
        ExecutionOutcome::Command {
            acknowledged: false,
            error: Some(error.into()),
        }
    }

    pub fn kind(&self) -> ActivityKind {
        match self {
            ExecutionOutcome::Install { .. } => ActivityKind::Install,
            ExecutionOutcome::Uninstall { .. } => ActivityKind::Uninstall,
            ExecutionOutcome::Script { .. } => ActivityKind::Script,
            ExecutionOutcome::Command { .. } => ActivityKind::Command,
        }
    }

    /// Kind-specific status rules.
    ///
    /// An empty pre-check output fails an install regardless of exit codes.
    /// Reports that do not yet carry the deciding field stay `Running`.
    pub fn status(&self) -> Status {
        match self {
            ExecutionOutcome::Install {
                pre_check_output,
                install_exit_code,
                post_install_exit_code,
                ..
            } => {
                if pre_check_output.as_deref() == Some("") {
                    return Status::Failed;
                }
                let failed = |code: &Option<i32>| matches!(code, Some(c) if *c != 0);
                if failed(install_exit_code) || failed(post_install_exit_code) {
                    Status::Failed
                } else if install_exit_code.is_some() {
                    Status::Succeeded
                } else {
                    Status::Running
                }
            }
            ExecutionOutcome::Uninstall { exit_code, .. }
            | ExecutionOutcome::Script { exit_code, .. } => match exit_code {
                Some(0) => Status::Succeeded,
                Some(_) => Status::Failed,
                None => Status::Running,
            },
            ExecutionOutcome::Command {
                acknowledged,
                error,
            } => {
                if error.is_some() {
                    Status::Failed
                } else if *acknowledged {
                    Status::Succeeded
                } else {
                    Status::Running
                }
            }
        }
    }
}

/// Outcome stored on an activity.
///
/// While the activity is Active a partial (`Running`) result may be replaced;
/// once `completed_at` is set the result is final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    pub fn new(outcome: ExecutionOutcome, now: DateTime<Utc>) -> Self {
        let status = outcome.status();
        Self {
            completed_at: status.is_terminal().then_some(now),
            outcome,
            status,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn install(pre: Option<&str>, install: Option<i32>, post: Option<i32>) -> ExecutionOutcome {
        ExecutionOutcome::Install {
            pre_check_output: pre.map(str::to_string),
            install_exit_code: install,
            install_output: None,
            post_install_exit_code: post,
            post_install_output: None,
        }
    }

    #[test]
    fn install_rules() {
        assert_eq!(install(None, Some(0), None).status(), Status::Succeeded);
        assert_eq!(install(Some("1"), Some(0), Some(0)).status(), Status::Succeeded);
        assert_eq!(install(None, Some(2), None).status(), Status::Failed);
        assert_eq!(install(None, Some(0), Some(1)).status(), Status::Failed);
        assert_eq!(install(None, None, None).status(), Status::Running);
    }

    #[test]
    fn empty_pre_check_fails_even_with_zero_exit_codes() {
        assert_eq!(install(Some(""), Some(0), Some(0)).status(), Status::Failed);
        assert_eq!(install(Some(""), None, None).status(), Status::Failed);
    }

    #[test]
    fn uninstall_and_script_rules() {
        assert_eq!(ExecutionOutcome::uninstalled(0).status(), Status::Succeeded);
        assert_eq!(ExecutionOutcome::uninstalled(1).status(), Status::Failed);
        assert_eq!(ExecutionOutcome::script(0, "ok").status(), Status::Succeeded);
        assert_eq!(ExecutionOutcome::script(-1, "boom").status(), Status::Failed);
        let pending = ExecutionOutcome::Script {
            exit_code: None,
            output: None,
        };
        assert_eq!(pending.status(), Status::Running);
    }

    #[test]
    fn command_rules() {
        assert_eq!(ExecutionOutcome::acknowledged().status(), Status::Succeeded);
        assert_eq!(ExecutionOutcome::command_error("Error").status(), Status::Failed);
        let waiting = ExecutionOutcome::Command {
            acknowledged: false,
            error: None,
        };
        assert_eq!(waiting.status(), Status::Running);
    }

    #[test]
    fn result_is_completed_only_for_terminal_status() {
        let now = Utc::now();
        assert!(ExecutionResult::new(ExecutionOutcome::acknowledged(), now).completed_at.is_some());
        let partial = ExecutionResult::new(install(None, None, None), now);
        assert_eq!(partial.status, Status::Running);
        assert!(partial.completed_at.is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn empty_pre_check_always_fails(
            install_code in proptest::option::of(any::<i32>()),
            post_code in proptest::option::of(any::<i32>()),
        ) {
            prop_assert_eq!(install(Some(""), install_code, post_code).status(), Status::Failed);
        }

        #[test]
        fn nonzero_install_code_always_fails(code in any::<i32>().prop_filter("non-zero", |c| *c != 0)) {
            prop_assert_eq!(install(Some("found"), Some(code), Some(0)).status(), Status::Failed);
        }
    }
}
