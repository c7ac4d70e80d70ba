//! Instance-size selection.
//!
//! Each provider carries a static descriptor table (RAM in GiB, virtual
//! CPUs, hourly price in USD). Selection is best-fit cheapest: the lowest
//! priced size satisfying the RAM and CPU ranges and the price ceiling.

use loom_blueprint::Range;
use loom_db::ProviderKind;

/// One bootable instance size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Description {
    pub size: &'static str,
    pub ram_gib: f64,
    pub cpus: f64,
    pub price: f64,
}

const AMAZON_DESCRIPTIONS: &[Description] = &[
    Description { size: "t2.micro", ram_gib: 1.0, cpus: 1.0, price: 0.013 },
    Description { size: "t2.small", ram_gib: 2.0, cpus: 1.0, price: 0.026 },
    Description { size: "t2.medium", ram_gib: 4.0, cpus: 2.0, price: 0.052 },
    Description { size: "m4.large", ram_gib: 8.0, cpus: 2.0, price: 0.12 },
    Description { size: "m4.xlarge", ram_gib: 16.0, cpus: 4.0, price: 0.239 },
    Description { size: "m4.2xlarge", ram_gib: 32.0, cpus: 8.0, price: 0.479 },
    Description { size: "c4.large", ram_gib: 3.75, cpus: 2.0, price: 0.105 },
    Description { size: "c4.xlarge", ram_gib: 7.5, cpus: 4.0, price: 0.209 },
];

const GOOGLE_DESCRIPTIONS: &[Description] = &[
    Description { size: "g1-small", ram_gib: 1.7, cpus: 1.0, price: 0.027 },
    Description { size: "n1-standard-1", ram_gib: 3.75, cpus: 1.0, price: 0.05 },
    Description { size: "n1-standard-2", ram_gib: 7.5, cpus: 2.0, price: 0.1 },
    Description { size: "n1-standard-4", ram_gib: 15.0, cpus: 4.0, price: 0.2 },
    Description { size: "n1-highcpu-4", ram_gib: 3.6, cpus: 4.0, price: 0.149 },
];

/// Descriptor table for `kind`. The local provider has no size menu.
pub fn descriptions(kind: ProviderKind) -> &'static [Description] {
    match kind {
        ProviderKind::Amazon => AMAZON_DESCRIPTIONS,
        ProviderKind::Google => GOOGLE_DESCRIPTIONS,
        ProviderKind::Vagrant => &[],
    }
}

/// The cheapest size of `kind` satisfying the constraints, or the empty
/// string when nothing does. A `max_price` of 0 means no ceiling.
pub fn choose_size(kind: ProviderKind, ram: Range, cpu: Range, max_price: f64) -> String {
    let mut best: Option<Description> = None;
    for &d in descriptions(kind) {
        if !ram.accepts(d.ram_gib) || !cpu.accepts(d.cpus) {
            continue;
        }
        if max_price != 0.0 && d.price > max_price {
            continue;
        }
        if best.map_or(true, |b| d.price < b.price) {
            best = Some(d);
        }
    }
    best.map(|d| d.size.to_string()).unwrap_or_default()
}
