use serde::{Deserialize, Serialize};

use armada_catalog::Payload;
use armada_core::{CoreError, CoreResult, ExecutionId, HostId};

use crate::activity::ActivityKind;

/// Snapshot of what an activated activity runs, in transport form.
///
/// Taken at activation so later catalog changes never alter an in-flight
/// activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delivery {
    Install {
        package_name: String,
        install_script: String,
        post_install_script: Option<String>,
        pre_check_query: Option<String>,
    },
    Uninstall {
        package_name: String,
        uninstall_script: String,
    },
    Script {
        contents: String,
    },
    Command {
        request_type: String,
        body: String,
    },
}

impl Delivery {
    pub fn materialize(
        kind: ActivityKind,
        payload: &Payload,
        host: HostId,
        execution_id: ExecutionId,
    ) -> CoreResult<Self> {
        match (kind, payload) {
            (
                ActivityKind::Install,
                Payload::Package {
                    package_name,
                    install_script,
                    post_install_script,
                    pre_check_query,
                    ..
                },
            ) => Ok(Delivery::Install {
                package_name: package_name.clone(),
                install_script: install_script.clone(),
                post_install_script: post_install_script.clone(),
                pre_check_query: pre_check_query.clone(),
            }),
            (
                ActivityKind::Uninstall,
                Payload::Package {
                    package_name,
                    uninstall_script,
                    ..
                },
            ) => Ok(Delivery::Uninstall {
                package_name: package_name.clone(),
                uninstall_script: uninstall_script.clone(),
            }),
            (ActivityKind::Script, Payload::Script { contents }) => Ok(Delivery::Script {
                contents: contents.clone(),
            }),
            (
                ActivityKind::Command,
                Payload::Command {
                    request_type,
                    template,
                },
            ) => Ok(Delivery::Command {
                request_type: request_type.clone(),
                body: render_template(template, host, execution_id),
            }),
            (kind, payload) => Err(CoreError::precondition(format!(
                "{kind} activity cannot run a {} payload",
                payload.kind_name()
            ))),
        }
    }
}

fn render_template(template: &str, host: HostId, execution_id: ExecutionId) -> String {
    template
        .replace("$HOST_ID", &host.to_string())
        .replace("$EXECUTION_ID", &execution_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_template_is_rendered() {
        let host = HostId::new();
        let exec = ExecutionId::new();
        let payload = Payload::command("InstallEnterpriseApplication", "<cmd host=\"$HOST_ID\" uuid=\"$EXECUTION_ID\"/>");
        let delivery = Delivery::materialize(ActivityKind::Command, &payload, host, exec).unwrap();
        match delivery {
            Delivery::Command { request_type, body } => {
                assert_eq!(request_type, "InstallEnterpriseApplication");
                assert!(body.contains(&host.to_string()));
                assert!(body.contains(&exec.to_string()));
                assert!(!body.contains('$'));
            }
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[test]
    fn package_materializes_for_install_and_uninstall() {
        let payload = Payload::package("app.pkg", "install.sh", "uninstall.sh");
        let install =
            Delivery::materialize(ActivityKind::Install, &payload, HostId::new(), ExecutionId::new()).unwrap();
        assert!(matches!(install, Delivery::Install { ref install_script, .. } if install_script == "install.sh"));
        let uninstall =
            Delivery::materialize(ActivityKind::Uninstall, &payload, HostId::new(), ExecutionId::new()).unwrap();
        assert!(matches!(uninstall, Delivery::Uninstall { ref uninstall_script, .. } if uninstall_script == "uninstall.sh"));
    }

    #[test]
    fn kind_mismatch_is_a_precondition_failure() {
        let payload = Payload::script("echo hi");
        let err = Delivery::materialize(ActivityKind::Install, &payload, HostId::new(), ExecutionId::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::PreconditionFailed(_)));
    }
}
