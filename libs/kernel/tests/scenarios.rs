//! End-to-end model executions through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use process_kernel::{
    Actor, BoundaryPort, BoundaryRelay, CompositeProcessDirector, ExecutiveLink, KernelConfig,
    KernelError, PortDirection, ProcessDirector, ProcessReceiver, Result,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn wait_until(deadline_ms: u64, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    predicate()
}

/// Emits a fixed sequence of tokens, one per cycle, then completes.
struct Source {
    name: String,
    output: Arc<ProcessReceiver<i64>>,
    tokens: Vec<i64>,
    next: usize,
}

impl Actor<i64> for Source {
    fn name(&self) -> &str {
        &self.name
    }

    fn fire(&mut self) -> Result<()> {
        self.output.put(self.tokens[self.next])?;
        self.next += 1;
        Ok(())
    }

    fn postfire(&mut self) -> Result<bool> {
        Ok(self.next < self.tokens.len())
    }
}

/// Reads tokens forever, recording each one.
struct Sink {
    name: String,
    input: Arc<ProcessReceiver<i64>>,
    seen: Arc<Mutex<Vec<i64>>>,
}

impl Actor<i64> for Sink {
    fn name(&self) -> &str {
        &self.name
    }

    fn fire(&mut self) -> Result<()> {
        let token = self.input.get()?;
        self.seen.lock().push(token);
        Ok(())
    }

    fn input_receivers(&self) -> Vec<Arc<ProcessReceiver<i64>>> {
        vec![Arc::clone(&self.input)]
    }
}

/// A finite producer feeding an insatiable consumer wedges the model: the
/// consumer's next read is a real deadlock that ends execution.
#[test]
fn finite_producer_starves_consumer() {
    init_tracing();
    let director = ProcessDirector::<i64>::new("pipeline", KernelConfig::default());
    let channel = director.new_receiver("source.out");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let source = Source {
        name: "source".into(),
        output: Arc::clone(&channel),
        tokens: vec![10, 20, 30],
        next: 0,
    };
    let sink = Sink {
        name: "sink".into(),
        input: channel,
        seen: Arc::clone(&seen),
    };

    director
        .initialize(vec![Box::new(source), Box::new(sink)])
        .expect("initialize");
    assert!(director.prefire().expect("prefire"));
    director.fire().expect("fire");
    assert!(!director.postfire().expect("postfire"));
    director.wrapup().expect("wrapup");

    assert_eq!(*seen.lock(), vec![10, 20, 30]);
    assert_eq!(director.core().active_count(), 0);
    assert_eq!(director.core().blocked_count(), 0);
}

/// A composite under a schedule-oriented executive: the inside drains the
/// tokens queued at its boundary, wedges externally, and the iteration ends
/// with postfire allowing more.
#[test]
fn external_deadlock_ends_iteration_under_schedule_executive() {
    init_tracing();
    let config = KernelConfig {
        queue_capacity: 4,
        ..KernelConfig::default()
    };
    let director =
        CompositeProcessDirector::new("composite", config, ExecutiveLink::<i64>::Schedule);
    let outside = director.new_receiver("in.outside");
    let inside = director.new_boundary_receiver("in.inside");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Sink {
        name: "sink".into(),
        input: Arc::clone(&inside),
        seen: Arc::clone(&seen),
    };
    let port = BoundaryPort {
        name: "in".into(),
        direction: PortDirection::Input,
        opaque: true,
        relays: vec![BoundaryRelay {
            producer: Arc::clone(&outside),
            consumer: inside,
        }],
    };

    director
        .initialize(vec![Box::new(sink)], vec![port])
        .expect("initialize");

    // Queue boundary tokens after initialize; initialization drains every
    // factory receiver.
    outside.put(1).expect("preload");
    outside.put(2).expect("preload");

    assert!(director.prefire().expect("prefire"));
    director.fire().expect("fire");
    assert!(director.postfire().expect("postfire"));

    // The sink keeps draining relayed tokens after fire returns; only the
    // iteration has ended.
    assert!(wait_until(2000, || *seen.lock() == vec![1, 2]));
    director.wrapup().expect("wrapup");
}

/// Reads one token from its trigger, forwards it to a boundary receiver of
/// a contained composite, and completes.
struct Absorber {
    trigger: Arc<ProcessReceiver<i64>>,
    outside: Arc<ProcessReceiver<i64>>,
}

impl Actor<i64> for Absorber {
    fn name(&self) -> &str {
        "absorber"
    }

    fn fire(&mut self) -> Result<()> {
        let token = self.trigger.get()?;
        self.outside.put(token)?;
        Ok(())
    }

    fn postfire(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn input_receivers(&self) -> Vec<Arc<ProcessReceiver<i64>>> {
        vec![Arc::clone(&self.trigger)]
    }
}

/// A composite nested inside another composite escalates its external
/// deadlock: the batch of boundary receivers is registered with the outer
/// composite's monitor as one blocked unit, progress on one of them
/// acknowledges the escalation and lets the inner fire return, and the
/// outer composite's own resolver then ends the outer model.
#[test]
fn external_deadlock_escalates_to_process_executive() {
    init_tracing();
    let outer = CompositeProcessDirector::new(
        "outer",
        KernelConfig::default(),
        ExecutiveLink::<i64>::Schedule,
    );
    let outside = outer.new_receiver("boundary.outside");
    let trigger = outer.new_receiver("absorber.trigger");

    let inner = CompositeProcessDirector::new(
        "inner",
        KernelConfig::default(),
        ExecutiveLink::Process(Arc::clone(outer.core())),
    );
    let inside = inner.new_boundary_receiver("boundary.inside");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Sink {
        name: "sink".into(),
        input: Arc::clone(&inside),
        seen: Arc::clone(&seen),
    };
    let port = BoundaryPort {
        name: "in".into(),
        direction: PortDirection::Input,
        opaque: true,
        relays: vec![BoundaryRelay {
            producer: Arc::clone(&outside),
            consumer: inside,
        }],
    };
    let absorber = Absorber {
        trigger: Arc::clone(&trigger),
        outside: Arc::clone(&outside),
    };

    outer
        .initialize(vec![Box::new(absorber)], Vec::new())
        .expect("initialize outer");
    assert!(outer.prefire().expect("prefire outer"));
    inner
        .initialize(vec![Box::new(sink)], vec![port])
        .expect("initialize inner");
    assert!(inner.prefire().expect("prefire inner"));

    let inner = Arc::new(inner);
    let firing = {
        let inner = Arc::clone(&inner);
        thread::spawn(move || inner.fire().and_then(|()| inner.postfire()))
    };

    // Two blocked units at the outer monitor: the absorber wedged on its
    // trigger, and the escalated batch from the inner composite.
    assert!(wait_until(2000, || outer.core().blocked_count() == 2));

    // Fire the absorber. Feeding the starved boundary receiver deregisters
    // the batch from the outer monitor and acknowledges the escalation.
    trigger.put(99).expect("trigger");
    assert!(firing.join().expect("join").expect("fire and postfire"));
    assert!(wait_until(2000, || outer.core().blocked_count() == 0));
    assert!(wait_until(2000, || outer.core().active_count() == 0));

    // With the absorber done, the outer composite's resolver sees a vacuous
    // internal deadlock and ends the outer model.
    outer.fire().expect("fire outer");
    assert!(!outer.postfire().expect("postfire outer"));

    inner.wrapup().expect("wrapup inner");
    outer.wrapup().expect("wrapup outer");
}

/// Terminate is destructive and final: wedged workers are released, the
/// thread roster is abandoned, and the director refuses further use.
#[test]
fn terminate_releases_wedged_workers_and_poisons_the_director() {
    init_tracing();
    let director = ProcessDirector::<i64>::new("doomed", KernelConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut actors: Vec<Box<dyn Actor<i64>>> = Vec::new();
    for i in 0..3 {
        actors.push(Box::new(Sink {
            name: format!("sink-{i}"),
            input: director.new_receiver(format!("sink-{i}.in")),
            seen: Arc::clone(&seen),
        }));
    }

    director.initialize(actors).expect("initialize");
    assert!(director.prefire().expect("prefire"));
    assert!(wait_until(2000, || director.core().blocked_count() == 3));

    director.terminate();
    assert!(wait_until(2000, || director.core().active_count() == 0));

    // Idempotent, and the director stays unusable.
    director.terminate();
    let err = director.initialize(Vec::new()).expect_err("poisoned");
    assert!(matches!(err, KernelError::Terminated { .. }));
}

/// Workers that exit on their own, without any director intervention, are
/// observed as a vacuous deadlock of zero active processes.
#[test]
fn self_completing_model_reaches_zero_active() {
    init_tracing();

    struct OneShot {
        fired: Arc<AtomicUsize>,
    }

    impl Actor<i64> for OneShot {
        fn name(&self) -> &str {
            "one-shot"
        }

        fn fire(&mut self) -> Result<()> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn postfire(&mut self) -> Result<bool> {
            Ok(false)
        }
    }

    let director = ProcessDirector::<i64>::new("oneshots", KernelConfig::default());
    let fired = Arc::new(AtomicUsize::new(0));
    let actors: Vec<Box<dyn Actor<i64>>> = (0..4)
        .map(|_| {
            Box::new(OneShot {
                fired: Arc::clone(&fired),
            }) as Box<dyn Actor<i64>>
        })
        .collect();

    director.initialize(actors).expect("initialize");
    assert!(director.prefire().expect("prefire"));
    director.fire().expect("fire");
    assert!(!director.postfire().expect("postfire"));
    director.wrapup().expect("wrapup");
    assert_eq!(fired.load(Ordering::SeqCst), 4);
}
