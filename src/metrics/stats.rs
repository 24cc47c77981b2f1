use hdrhistogram::Histogram;

/// Integer-valued latency histogram (values in microseconds).
#[derive(Clone, Debug)]
pub struct Histo {
    inner: Histogram<u64>,
}

impl Default for Histo {
    fn default() -> Self {
        Self {
            inner: Histogram::new(3).expect("histo"),
        }
    }
}

impl Histo {
    pub fn record(&mut self, v: u64) {
        self.inner.saturating_record(v.max(1));
    }

    pub fn p50(&self) -> u64 {
        self.inner.value_at_quantile(0.50)
    }

    pub fn p99(&self) -> u64 {
        self.inner.value_at_quantile(0.99)
    }

    pub fn max(&self) -> u64 {
        self.inner.max()
    }

    pub fn count(&self) -> u64 {
        self.inner.len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LatencySummary {
    pub count: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl From<&Histo> for LatencySummary {
    fn from(h: &Histo) -> Self {
        Self {
            count: h.count(),
            p50_us: h.p50(),
            p99_us: h.p99(),
            max_us: h.max(),
        }
    }
}
