//! Seeded catalog simulation shared by integration tests and benchmarks.
//!
//! Included with `#[path = "../src/test_support.rs"]` so `rand` stays a dev-dependency.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use time::{Date, Duration};

use fundhist::{Entity, IdentityHasher, Snapshot, SnapshotBuilder};

/// Hasher matching the simulated catalog: identity by URL, content by title and URL.
#[allow(dead_code)]
pub fn catalog_hasher() -> IdentityHasher {
    IdentityHasher::new(
        vec!["url".to_string()],
        vec!["title".to_string(), "url".to_string()],
    )
    .expect("non-empty identity fields")
}

#[allow(dead_code)]
pub fn program(id: u32, revision: u32) -> Entity {
    Entity::new()
        .with(
            "url",
            format!("https://www.foerderdatenbank.de/FDB/Content/DE/Foerderprogramm/p{id:06}.html"),
        )
        .with("title", format!("Förderprogramm {id} (Fassung {revision})"))
}

/// A catalog whose entries appear, vanish, return and get edited between runs.
#[derive(Debug, Clone)]
pub struct CatalogSimulator {
    rng: StdRng,
    /// (id, revision, visible)
    entries: Vec<(u32, u32, bool)>,
    next_id: u32,
    date: Date,
    pub churn: f64,
    pub edit_rate: f64,
}

#[allow(dead_code)]
impl CatalogSimulator {
    pub fn new(seed: u64, initial: u32, start: Date) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            entries: (0..initial).map(|id| (id, 0, true)).collect(),
            next_id: initial,
            date: start,
            churn: 0.05,
            edit_rate: 0.02,
        }
    }

    /// Snapshot of the current state without advancing.
    pub fn snapshot(&self) -> Snapshot {
        let mut builder = SnapshotBuilder::new(self.date);
        builder.extend(
            self.entries
                .iter()
                .filter(|(_, _, visible)| *visible)
                .map(|(id, revision, _)| program(*id, *revision)),
        );
        builder.finish().expect("no expectation declared")
    }

    /// Advance one week, mutating the catalog, and return the new snapshot.
    pub fn step(&mut self) -> Snapshot {
        self.date += Duration::weeks(1);
        for entry in &mut self.entries {
            if self.rng.random_bool(self.churn) {
                entry.2 = !entry.2;
            }
            if entry.2 && self.rng.random_bool(self.edit_rate) {
                entry.1 += 1;
            }
        }
        let arrivals = self.rng.random_range(0..=3);
        for _ in 0..arrivals {
            self.entries.push((self.next_id, 0, true));
            self.next_id += 1;
        }
        self.snapshot()
    }

    pub fn date(&self) -> Date {
        self.date
    }

    /// Number of identities ever created
    pub fn identities(&self) -> usize {
        self.entries.len()
    }
}
