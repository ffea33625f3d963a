//! Test double that records invocations and answers from a closure.

use std::sync::Mutex;

use super::{ExecResult, Executor, Invocation, OutputSink};

type Responder = Box<dyn Fn(&Invocation) -> ExecResult + Send + Sync>;

pub(crate) struct ScriptedExecutor {
    calls: Mutex<Vec<Invocation>>,
    responder: Responder,
}

impl ScriptedExecutor {
    pub(crate) fn new(
        responder: impl Fn(&Invocation) -> ExecResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    /// Every invocation succeeds with no output.
    pub(crate) fn succeeding() -> Self {
        Self::new(|_| ExecResult::succeeded(Vec::new()))
    }

    pub(crate) fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Every command of every invocation, rendered as a command line.
    pub(crate) fn command_lines(&self) -> Vec<String> {
        self.calls()
            .iter()
            .flat_map(|invocation| invocation.commands.iter().map(|c| c.to_string()))
            .collect()
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, invocation: &Invocation, sink: &dyn OutputSink) -> ExecResult {
        self.calls.lock().unwrap().push(invocation.clone());
        let result = (self.responder)(invocation);
        for line in &result.output {
            sink.write_line(line);
        }
        result
    }
}
