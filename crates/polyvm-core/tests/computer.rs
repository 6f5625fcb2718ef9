//! Full-stack tests: a [`Computer`] running on a real scheduler, booted from
//! a fake machine factory.

use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use polyvm_api::env::{ComputerEnvironment, GlobalEnvironment, MetricsObserver};
use polyvm_api::fs::{Mount, WritableMount};
use polyvm_api::machine::{
    MachineEnvironment, MachineError, MachineFactory, MachineResult, ScriptMachine,
};
use polyvm_api::NoOpMetrics;
use polyvm_core::fs::MemoryMount;
use polyvm_core::{ChangeSet, Computer, ComputerContext, CoreConfig, Terminal};

struct TestEnv;

impl ComputerEnvironment for TestEnv {
    fn day(&self) -> u32 {
        0
    }
    fn time_of_day(&self) -> f64 {
        12.0
    }
    fn metrics(&self) -> Arc<dyn MetricsObserver> {
        Arc::new(NoOpMetrics)
    }
    fn create_root_mount(&self) -> anyhow::Result<Arc<dyn WritableMount>> {
        Ok(Arc::new(MemoryMount::new()))
    }
}

struct TestGlobal;

impl GlobalEnvironment for TestGlobal {
    fn host_string(&self) -> String {
        "polyvm test".to_owned()
    }
    fn create_resource_mount(&self, _domain: &str, _sub_path: &str) -> Option<Arc<dyn Mount>> {
        let rom = MemoryMount::new();
        rom.add_file("startup", b"hello".to_vec()).ok()?;
        Some(Arc::new(rom))
    }
    fn create_resource_file(&self, _domain: &str, _sub_path: &str) -> Option<Box<dyn Read + Send>> {
        Some(Box::new(Cursor::new(b"boot script".to_vec())))
    }
}

/// Records every event it is resumed with.
struct RecordingMachine {
    log: Arc<Mutex<Vec<String>>>,
}

impl ScriptMachine for RecordingMachine {
    fn handle_event(&self, event: Option<&str>, _args: &[Value]) -> MachineResult {
        self.log.lock().unwrap().push(event.unwrap_or("<boot>").to_owned());
        MachineResult::Ok
    }
    fn close(&self) {}
}

struct RecordingFactory {
    log: Arc<Mutex<Vec<String>>>,
    boots: AtomicUsize,
}

impl MachineFactory for RecordingFactory {
    fn create(
        &self,
        _env: MachineEnvironment,
        entry_script: &mut dyn Read,
    ) -> Result<Arc<dyn ScriptMachine>, MachineError> {
        let mut script = String::new();
        entry_script
            .read_to_string(&mut script)
            .map_err(|e| MachineError(e.to_string()))?;
        assert_eq!(script, "boot script");
        self.boots.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(RecordingMachine { log: self.log.clone() }))
    }
}

struct Fixture {
    context: ComputerContext,
    computer: Arc<Computer>,
    log: Arc<Mutex<Vec<String>>>,
    factory: Arc<RecordingFactory>,
}

fn fixture() -> Fixture {
    let log = Arc::new(Mutex::new(Vec::new()));
    let factory =
        Arc::new(RecordingFactory { log: log.clone(), boots: AtomicUsize::new(0) });
    let context =
        ComputerContext::new(CoreConfig::default(), Arc::new(TestGlobal), factory.clone());
    let computer =
        Computer::new(&context, Arc::new(TestEnv), Arc::new(Terminal::new(51, 19, false)), 7);
    Fixture { context, computer, log, factory }
}

fn wait_for(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn boots_processes_events_and_shuts_down() {
    let fx = fixture();
    assert!(!fx.computer.is_on());

    fx.computer.turn_on();
    fx.computer.tick();
    wait_for("computer to boot", Duration::from_secs(10), || fx.computer.is_on());
    assert_eq!(fx.log.lock().unwrap().as_slice(), ["<boot>"]);

    fx.computer.tick();
    assert!(fx.computer.poll_and_reset_changes().contains(ChangeSet::STATE));
    assert!(fx.computer.poll_and_reset_changes().is_empty());

    fx.computer.queue_event("key", vec![Value::from(65)]);
    fx.computer.queue_event("key_up", vec![Value::from(65)]);
    wait_for("events to be delivered", Duration::from_secs(10), || {
        fx.log.lock().unwrap().len() == 3
    });
    assert_eq!(fx.log.lock().unwrap().as_slice(), ["<boot>", "key", "key_up"]);

    fx.computer.shutdown();
    wait_for("computer to stop", Duration::from_secs(10), || !fx.computer.is_on());
    assert!(fx.computer.file_system().is_none());

    assert!(fx.context.stop(Duration::from_secs(5)));
}

#[test]
fn reboot_creates_a_fresh_machine() {
    let fx = fixture();
    fx.computer.turn_on();
    fx.computer.tick();
    wait_for("boot", Duration::from_secs(10), || fx.computer.is_on());

    fx.computer.reboot();
    wait_for("second boot", Duration::from_secs(10), || {
        fx.factory.boots.load(Ordering::SeqCst) == 2 && fx.computer.is_on()
    });

    assert!(fx.context.stop(Duration::from_secs(5)));
}

#[test]
fn start_requests_are_rate_limited_after_a_boot() {
    let fx = fixture();
    fx.computer.turn_on();
    fx.computer.tick();
    wait_for("boot", Duration::from_secs(10), || fx.computer.is_on());

    fx.computer.shutdown();
    wait_for("shutdown", Duration::from_secs(10), || !fx.computer.is_on());

    // A second start within the delay window is deferred, not dropped.
    fx.computer.turn_on();
    for _ in 0..10 {
        fx.computer.tick();
    }
    assert_eq!(fx.factory.boots.load(Ordering::SeqCst), 1);

    for _ in 0..60 {
        fx.computer.tick();
    }
    wait_for("deferred boot", Duration::from_secs(10), || fx.computer.is_on());
    assert_eq!(fx.factory.boots.load(Ordering::SeqCst), 2);

    assert!(fx.context.stop(Duration::from_secs(5)));
}

#[test]
fn unloaded_computer_stays_off() {
    let fx = fixture();
    fx.computer.turn_on();
    fx.computer.tick();
    wait_for("boot", Duration::from_secs(10), || fx.computer.is_on());

    fx.computer.unload();
    wait_for("unload", Duration::from_secs(10), || !fx.computer.is_on());

    fx.computer.turn_on();
    for _ in 0..60 {
        fx.computer.tick();
        thread::sleep(Duration::from_millis(1));
    }
    assert!(!fx.computer.is_on());

    assert!(fx.context.stop(Duration::from_secs(5)));
}

#[test]
fn main_thread_tasks_run_on_the_host_tick() {
    let fx = fixture();
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let counter = counter.clone();
        assert!(fx.computer.queue_main_thread(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    fx.context.tick();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    assert!(fx.context.stop(Duration::from_secs(5)));
}

#[test]
fn label_changes_are_reported_once() {
    let fx = fixture();
    fx.computer.set_label(Some("server".to_owned()));
    assert_eq!(fx.computer.label().as_deref(), Some("server"));
    assert!(fx.computer.poll_and_reset_changes().contains(ChangeSet::LABEL));

    fx.computer.set_label(Some("server".to_owned()));
    assert!(!fx.computer.poll_and_reset_changes().contains(ChangeSet::LABEL));

    assert!(fx.context.stop(Duration::from_secs(5)));
}
