//! Scripted stand-ins for the model backend and the execution engine.

use crate::backend::{ModelBackend, Prompt};
use crate::engine::{ExecutionEngine, ProgramRun, RawExecution};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    /// Never answers; exercises the call timeout
    Hang,
    Fail(String),
}

impl Reply {
    pub fn text(text: &str) -> Self {
        Reply::Text(text.to_string())
    }
}

type Handler = Box<dyn Fn(&Prompt) -> Reply + Send + Sync>;

enum Script {
    Queue(VecDeque<Reply>),
    Repeat(Reply),
    Handler(Handler),
}

pub struct ScriptedBackend {
    script: Mutex<Script>,
    calls: Mutex<Vec<(String, Prompt)>>,
}

impl ScriptedBackend {
    /// Replies handed out in order; calls past the end fail
    pub fn new(replies: Vec<Reply>) -> Self {
        Self::from_script(Script::Queue(replies.into()))
    }

    pub fn repeating(reply: Reply) -> Self {
        Self::from_script(Script::Repeat(reply))
    }

    /// Reply computed from the prompt
    pub fn with_handler(handler: impl Fn(&Prompt) -> Reply + Send + Sync + 'static) -> Self {
        Self::from_script(Script::Handler(Box::new(handler)))
    }

    fn from_script(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Model names, one per backend call
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.calls.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn last_prompt(&self) -> Option<Prompt> {
        self.calls.lock().unwrap().last().map(|(_, p)| p.clone())
    }

    /// Number of calls whose prompt contains `needle`
    pub fn calls_containing(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.user.contains(needle))
            .count()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn complete(&self, model: &str, prompt: &Prompt) -> anyhow::Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), prompt.clone()));

        let reply = match &mut *self.script.lock().unwrap() {
            Script::Queue(queue) => queue
                .pop_front()
                .unwrap_or_else(|| Reply::Fail("script exhausted".to_string())),
            Script::Repeat(reply) => reply.clone(),
            Script::Handler(handler) => handler(prompt),
        };

        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Fail(message) => anyhow::bail!(message),
            Reply::Hang => std::future::pending().await,
        }
    }
}

type Behavior = Box<dyn Fn(&str) -> RawExecution + Send + Sync>;

/// Engine that maps program text to a function of stdin
#[derive(Default)]
pub struct ScriptedEngine {
    programs: HashMap<String, Behavior>,
    runs: Mutex<usize>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register behavior for `code`; lookups ignore surrounding whitespace
    pub fn program(
        mut self,
        code: &str,
        behavior: impl Fn(&str) -> RawExecution + Send + Sync + 'static,
    ) -> Self {
        self.programs.insert(code.trim().to_string(), Box::new(behavior));
        self
    }

    pub fn runs(&self) -> usize {
        *self.runs.lock().unwrap()
    }
}

/// Successful run printing `stdout`
pub fn prints(stdout: impl Into<String>) -> RawExecution {
    RawExecution {
        stdout: stdout.into(),
        exit_code: Some(0),
        execution_time_ms: 1,
        ..Default::default()
    }
}

/// Crashed run with `stderr`
pub fn crashes(stderr: impl Into<String>) -> RawExecution {
    RawExecution {
        stderr: stderr.into(),
        exit_code: Some(1),
        execution_time_ms: 1,
        runtime_error: true,
        ..Default::default()
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, program: &ProgramRun) -> anyhow::Result<RawExecution> {
        *self.runs.lock().unwrap() += 1;
        let behavior = program
            .files
            .iter()
            .find_map(|(_, contents)| self.programs.get(contents.trim()));
        match behavior {
            Some(behavior) => Ok(behavior(&program.stdin)),
            None => Ok(crashes("NameError: unknown program")),
        }
    }
}
