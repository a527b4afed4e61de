//! Test doubles shared by the unit tests in this crate.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use futures_util::future::BoxFuture;

use crate::command_runner::{CommandError, CommandOutput, CommandRunner};

pub(crate) fn temp_dir_for(test_name: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "appforge-agent-{test_name}-{}-{n}-{ts}",
        std::process::id()
    ));
    dir
}

#[derive(Debug, Default)]
struct FakeState {
    // container name -> published host port
    running: BTreeMap<String, u16>,
    foreign_ports: Vec<String>,
    calls: Vec<Vec<String>>,
    unreachable: bool,
    ps_broken: bool,
    run_failure: Option<String>,
    logs: (String, String),
}

/// Scripted stand-in for the container CLI.
#[derive(Debug, Default)]
pub(crate) struct FakeDocker {
    state: Mutex<FakeState>,
}

impl FakeDocker {
    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut st = self.state.lock().unwrap();
        f(&mut st)
    }

    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.with(|s| s.calls.clone())
    }

    pub(crate) fn count(&self, subcommand: &str) -> usize {
        self.with(|s| {
            s.calls
                .iter()
                .filter(|c| c.first().is_some_and(|a| a == subcommand))
                .count()
        })
    }

    pub(crate) fn set_running(&self, name: &str, port: u16) {
        self.with(|s| {
            s.running.insert(name.to_string(), port);
        });
    }

    /// Out-of-band kill, as if someone ran `docker kill` by hand.
    pub(crate) fn kill(&self, name: &str) {
        self.with(|s| {
            s.running.remove(name);
        });
    }

    pub(crate) fn publish_foreign(&self, mapping: &str) {
        self.with(|s| s.foreign_ports.push(mapping.to_string()));
    }

    pub(crate) fn set_unreachable(&self, v: bool) {
        self.with(|s| s.unreachable = v);
    }

    pub(crate) fn set_ps_broken(&self, v: bool) {
        self.with(|s| s.ps_broken = v);
    }

    pub(crate) fn fail_run(&self, stderr: &str) {
        self.with(|s| s.run_failure = Some(stderr.to_string()));
    }

    pub(crate) fn set_logs(&self, stdout: &str, stderr: &str) {
        self.with(|s| s.logs = (stdout.to_string(), stderr.to_string()));
    }

    fn respond(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        let fail = |stderr: String| CommandError::Failed {
            program: program.to_string(),
            code: Some(1),
            stderr,
        };
        let ok = |stdout: String| CommandOutput {
            stdout,
            stderr: String::new(),
        };

        let mut st = self.state.lock().unwrap();
        st.calls.push(args.to_vec());
        if st.unreachable {
            return Err(fail(
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock".to_string(),
            ));
        }

        let name = args.last().cloned().unwrap_or_default();
        match args.first().map(String::as_str) {
            Some("inspect") => {
                if st.running.contains_key(&name) {
                    Ok(ok("true\n".to_string()))
                } else {
                    Err(fail(format!("Error: No such object: {name}")))
                }
            }
            Some("run") => {
                if let Some(stderr) = st.run_failure.clone() {
                    return Err(fail(stderr));
                }
                let value_of = |flag: &str| {
                    args.windows(2)
                        .find(|w| w[0] == flag)
                        .map(|w| w[1].clone())
                        .unwrap_or_default()
                };
                let cname = value_of("--name");
                if st.running.contains_key(&cname) {
                    return Err(fail(format!(
                        "docker: Error response from daemon: Conflict. The container name \"/{cname}\" is already in use."
                    )));
                }
                let host_port = value_of("--publish")
                    .split(':')
                    .next()
                    .and_then(|p| p.parse::<u16>().ok())
                    .unwrap_or(0);
                st.running.insert(cname, host_port);
                Ok(ok("0123456789abcdef\n".to_string()))
            }
            Some("rm") => {
                if st.running.remove(&name).is_some() {
                    Ok(ok(format!("{name}\n")))
                } else {
                    Err(fail(format!(
                        "Error response from daemon: No such container: {name}"
                    )))
                }
            }
            Some("ps") => {
                if st.ps_broken {
                    return Err(fail("unknown flag: --format".to_string()));
                }
                let mut lines: Vec<String> = st
                    .running
                    .iter()
                    .map(|(n, p)| {
                        format!(r#"{{"Names":"{n}","Ports":"0.0.0.0:{p}->3000/tcp"}}"#)
                    })
                    .collect();
                lines.extend(st.foreign_ports.iter().cloned());
                Ok(ok(lines.join("\n")))
            }
            Some("logs") => Ok(CommandOutput {
                stdout: st.logs.0.clone(),
                stderr: st.logs.1.clone(),
            }),
            _ => Err(fail(format!("unexpected command: {args:?}"))),
        }
    }
}

impl CommandRunner for FakeDocker {
    fn output<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
    ) -> BoxFuture<'a, Result<CommandOutput, CommandError>> {
        Box::pin(async move { self.respond(program, args) })
    }
}
