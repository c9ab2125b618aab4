//! Shared capability and handler used by the integration tests

#![allow(dead_code)]

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use switchyard::runtime::{
    Call, CallbackReference, Capability, CapabilityDescriptor, CompletionError, Handler,
    HandlerResult, Payload, Proxy, StallPolicy,
};
use switchyard::{Reactor, ReactorConfig};

/// Generous bound for anything that is expected to resolve
pub const WAIT: Duration = Duration::from_secs(5);

/// Short bound for anything that is expected to stay pending
pub const PAUSE: Duration = Duration::from_millis(150);

pub struct Journal;

pub enum JournalCall {
    Record(u32),
    Fail(String),
    Panic,
    /// Logs entry, then blocks the worker until the sender fires or hangs up
    Gate(Receiver<()>),
}

impl Call for JournalCall {
    fn method(&self) -> &'static str {
        match self {
            JournalCall::Record(_) => "record",
            JournalCall::Fail(_) => "fail",
            JournalCall::Panic => "panic",
            JournalCall::Gate(_) => "gate",
        }
    }
}

impl Capability for Journal {
    type Call = JournalCall;
    type Output = u32;
    const DESCRIPTOR: CapabilityDescriptor = CapabilityDescriptor {
        name: "journal",
        methods: &["record", "fail", "panic", "gate"],
    };
}

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Handler that writes every call and hook into a shared log
pub struct Recorder {
    pub label: &'static str,
    pub log: Log,
    /// Hook that returns an error after logging
    pub failing_hook: Option<&'static str>,
}

impl Recorder {
    pub fn new(label: &'static str, log: &Log) -> Self {
        Self {
            label,
            log: log.clone(),
            failing_hook: None,
        }
    }

    /// Recorder whose `hook` fails
    pub fn failing(label: &'static str, log: &Log, hook: &'static str) -> Self {
        Self {
            failing_hook: Some(hook),
            ..Self::new(label, log)
        }
    }

    fn note(&self, event: String) {
        self.log.lock().unwrap().push(format!("{}.{}", self.label, event));
    }

    fn hook(&self, name: &'static str, event: String) -> HandlerResult<()> {
        self.note(event);
        if self.failing_hook == Some(name) {
            anyhow::bail!("{} hook of {} failed", name, self.label);
        }
        Ok(())
    }
}

impl Handler<Journal> for Recorder {
    fn invoke(&mut self, _proxy: &Proxy<Journal>, call: JournalCall) -> HandlerResult<u32> {
        match call {
            JournalCall::Record(n) => {
                self.note(format!("record({n})"));
                Ok(n)
            }
            JournalCall::Fail(reason) => {
                self.note("fail".to_string());
                anyhow::bail!("{reason}")
            }
            JournalCall::Panic => panic!("recorder {} panicked", self.label),
            JournalCall::Gate(gate) => {
                self.note("gate".to_string());
                let _ = gate.recv();
                Ok(0)
            }
        }
    }

    fn registered(&mut self, _proxy: &Proxy<Journal>) -> HandlerResult<()> {
        self.hook("registered", "registered".to_string())
    }

    fn unregistered(&mut self, _proxy: &Proxy<Journal>) -> HandlerResult<()> {
        self.hook("unregistered", "unregistered".to_string())
    }

    fn deassigned(
        &mut self,
        _proxy: &Proxy<Journal>,
        new: Option<&dyn Handler<Journal>>,
    ) -> HandlerResult<()> {
        self.hook("deassigned", format!("deassigned(new={})", new.is_some()))
    }

    fn reassigned(
        &mut self,
        _proxy: &Proxy<Journal>,
        old: Option<&dyn Handler<Journal>>,
    ) -> HandlerResult<()> {
        self.hook("reassigned", format!("reassigned(old={})", old.is_some()))
    }
}

pub fn config() -> ReactorConfig {
    ReactorConfig {
        worker_threads: 4,
        ..ReactorConfig::default()
    }
}

pub fn reactor() -> Reactor {
    Reactor::new(config()).unwrap()
}

pub fn reactor_with(policy: StallPolicy) -> Reactor {
    Reactor::new(ReactorConfig {
        stall_policy: policy,
        ..config()
    })
    .unwrap()
}

/// Resolve and wait with the default bound
pub fn wait(reactor: &Reactor, reference: CallbackReference) -> Result<Payload, CompletionError> {
    reactor.resolve(reference).unwrap().wait(Some(WAIT))
}

/// Resolve, wait, and read back a recorded value
pub fn wait_value(reactor: &Reactor, reference: CallbackReference) -> u32 {
    *reactor
        .resolve(reference)
        .unwrap()
        .wait_for::<u32>(Some(WAIT))
        .unwrap()
}

/// Poll until the log holds `entry`
pub fn await_entry(log: &Log, entry: &str) {
    let deadline = std::time::Instant::now() + WAIT;
    while !entries(log).iter().any(|e| e == entry) {
        assert!(std::time::Instant::now() < deadline, "timed out waiting for {entry}");
        std::thread::sleep(Duration::from_millis(5));
    }
}
