//! Recording launcher for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ChildProcess, CommandSpec, ProcessLauncher};
use crate::error::{BluetoothError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Output(CommandSpec),
    Spawn(CommandSpec, u32),
    Terminate(u32),
}

#[derive(Default)]
struct State {
    events: Vec<Event>,
    next_pid: u32,
    alive: HashSet<u32>,
    outputs: HashMap<String, VecDeque<std::result::Result<String, String>>>,
    unlaunchable: HashSet<String>,
}

#[derive(Default, Clone)]
pub struct FakeLauncher {
    state: Arc<Mutex<State>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue stdout for the next `output` run of `program`.
    pub fn respond(&self, program: &str, stdout: &str) {
        self.queue(program, Ok(stdout.to_string()));
    }

    /// Make the next `output` run of `program` exit non-zero.
    pub fn fail(&self, program: &str) {
        self.queue(program, Err("exit status: 1".to_string()));
    }

    fn queue(&self, program: &str, outcome: std::result::Result<String, String>) {
        let mut state = self.state.lock().unwrap();
        state
            .outputs
            .entry(program.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// `spawn` of `program` fails as if the binary were missing.
    pub fn unlaunchable(&self, program: &str) {
        self.state
            .lock()
            .unwrap()
            .unlaunchable
            .insert(program.to_string());
    }

    /// Simulate the child exiting on its own.
    pub fn exit(&self, pid: u32) {
        self.state.lock().unwrap().alive.remove(&pid);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn spawned(&self) -> Vec<CommandSpec> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Spawn(spec, _) => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn alive(&self) -> usize {
        self.state.lock().unwrap().alive.len()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn output(&self, spec: &CommandSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.events.push(Event::Output(spec.clone()));
        match state
            .outputs
            .get_mut(&spec.program)
            .and_then(VecDeque::pop_front)
        {
            Some(Ok(stdout)) => Ok(stdout),
            Some(Err(status)) => Err(BluetoothError::ProcessFailed {
                program: spec.program.clone(),
                status,
            }),
            None => Ok(String::new()),
        }
    }

    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ChildProcess>> {
        let mut state = self.state.lock().unwrap();
        if state.unlaunchable.contains(&spec.program) {
            return Err(BluetoothError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.alive.insert(pid);
        state.events.push(Event::Spawn(spec.clone(), pid));

        Ok(Box::new(FakeChild {
            pid,
            state: self.state.clone(),
        }))
    }
}

struct FakeChild {
    pid: u32,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_running(&mut self) -> bool {
        self.state.lock().unwrap().alive.contains(&self.pid)
    }

    async fn terminate(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(Event::Terminate(self.pid));
        state.alive.remove(&self.pid);
        Ok(())
    }
}

impl Drop for FakeChild {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.alive.remove(&self.pid);
        }
    }
}
