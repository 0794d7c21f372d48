//! Counter and gauge primitives with Prometheus text rendering.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Anything rendered as one sample per cache.
pub trait Instrument {
    fn name(&self) -> &'static str;
    fn help(&self) -> &'static str;
    fn kind(&self) -> &'static str;
    fn sample(&self) -> i128;

    /// Append the `# HELP`/`# TYPE` header and the sample labelled with `cache`.
    fn render(&self, cache: &str, out: &mut String) {
        let name = self.name();
        let _ = write!(
            out,
            "# HELP {name} {}\n# TYPE {name} {}\n{name}{{cache=\"{cache}\"}} {}\n",
            self.help(),
            self.kind(),
            self.sample()
        );
    }
}

/// Monotonic count of transfer events.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self { name, help, value: AtomicU64::new(0) }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Instrument for Counter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn help(&self) -> &'static str {
        self.help
    }

    fn kind(&self) -> &'static str {
        "counter"
    }

    fn sample(&self) -> i128 {
        self.get().into()
    }
}

/// In-flight work, such as segments currently being received.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self { name, help, value: AtomicI64::new(0) }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn add(&self, n: i64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub(&self, n: i64) {
        self.value.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Current value, with a transient negative reading clamped to zero.
    pub fn get_clamped(&self) -> u64 {
        self.get().max(0) as u64
    }
}

impl Instrument for Gauge {
    fn name(&self) -> &'static str {
        self.name
    }

    fn help(&self) -> &'static str {
        self.help
    }

    fn kind(&self) -> &'static str {
        "gauge"
    }

    fn sample(&self) -> i128 {
        self.get().into()
    }
}
