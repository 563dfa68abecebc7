//! The series index: maps log series refs to their shippable labels and
//! metadata, and tracks which log segment each ref was last seen in so
//! checkpoints can garbage-collect stale entries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use courier_model::relabel::{self, RelabelRule};
use courier_model::{Interner, Label, LabelBuilder, Labels, Metadata, MetadataRecord, SeriesRecord, SeriesRef};
use parking_lot::Mutex;

/// Result of resolving a ref at append time.
pub(crate) enum SeriesLookup {
    Found {
        labels: Labels,
        metadata: Option<Metadata>,
    },
    /// Relabelling dropped this series on purpose.
    DroppedByRelabel,
    /// The ref was never stored; samples for it cannot be labelled.
    Unknown {
        /// True the first time this ref is reported, so the caller can log
        /// it without flooding.
        first_sighting: bool,
    },
}

pub(crate) struct SeriesIndex {
    external_labels: Vec<Label>,
    relabel_rules: Vec<RelabelRule>,
    interner: Arc<dyn Interner>,
    /// Whether per-series metadata is kept for inline shipping (v2). On v1
    /// metadata travels on the legacy side channel instead.
    keep_metadata: bool,

    // Lock order: `series` before `segments`, always.
    series: Mutex<SeriesTable>,
    segments: Mutex<HashMap<SeriesRef, u32>>,
}

#[derive(Default)]
struct SeriesTable {
    labels: HashMap<SeriesRef, Labels>,
    metadata: HashMap<SeriesRef, Metadata>,
    dropped: HashSet<SeriesRef>,
    reported_unknown: HashSet<SeriesRef>,
    builder: LabelBuilder,
}

impl SeriesIndex {
    pub fn new(
        external_labels: Vec<Label>,
        relabel_rules: Vec<RelabelRule>,
        interner: Arc<dyn Interner>,
        keep_metadata: bool,
    ) -> Self {
        Self {
            external_labels,
            relabel_rules,
            interner,
            keep_metadata,
            series: Mutex::new(SeriesTable::default()),
            segments: Mutex::new(HashMap::new()),
        }
    }

    /// Records a batch of series definitions from segment `segment`. Labels
    /// are rebuilt through external labels (raw value wins) and the relabel
    /// rules; series the rules reject go to the dropped set so their
    /// samples are classified as intentional drops.
    pub fn store_series(&self, records: &[SeriesRecord], segment: u32) {
        let mut table = self.series.lock();
        let mut segments = self.segments.lock();
        for record in records {
            // Every ref is tracked for GC, kept or dropped.
            segments.insert(record.series, segment);

            table.builder.reset(&record.labels);
            table.builder.merge_defaults(&self.external_labels);
            // A ref lives in exactly one of the active and dropped sets.
            if !relabel::process_builder(&mut table.builder, &self.relabel_rules) {
                if let Some(previous) = table.labels.remove(&record.series) {
                    self.release_labels(&previous);
                }
                table.dropped.insert(record.series);
                continue;
            }
            table.dropped.remove(&record.series);
            let labels = table.builder.labels();
            self.intern_labels(&labels);
            // A ref should never be redefined, but if it is the old interned
            // strings must not leak.
            if let Some(previous) = table.labels.insert(record.series, labels) {
                self.release_labels(&previous);
            }
        }
    }

    /// Records metadata for refs. No-op unless the wire format ships
    /// metadata inline.
    pub fn store_metadata(&self, records: &[MetadataRecord]) {
        if !self.keep_metadata {
            return;
        }
        let mut table = self.series.lock();
        for record in records {
            table.metadata.insert(
                record.series,
                Metadata {
                    metric_type: record.metric_type,
                    unit: record.unit.clone(),
                    help: record.help.clone(),
                },
            );
        }
    }

    /// Re-stamps refs with the segment they were seen in, without
    /// rebuilding labels.
    pub fn update_segment(&self, records: &[SeriesRecord], segment: u32) {
        let mut segments = self.segments.lock();
        for record in records {
            segments.insert(record.series, segment);
        }
    }

    /// Drops every ref whose latest segment is older than `segment`,
    /// releasing the interned label strings it held. Called when the log
    /// has taken a checkpoint through that segment.
    pub fn checkpoint(&self, segment: u32) {
        let mut table = self.series.lock();
        let mut segments = self.segments.lock();
        let table = &mut *table;
        segments.retain(|series_ref, seen_in| {
            if *seen_in >= segment {
                return true;
            }
            if let Some(labels) = table.labels.remove(series_ref) {
                self.release_labels(&labels);
            }
            table.metadata.remove(series_ref);
            table.dropped.remove(series_ref);
            table.reported_unknown.remove(series_ref);
            false
        });
    }

    pub fn lookup(&self, series_ref: SeriesRef) -> SeriesLookup {
        let mut table = self.series.lock();
        if let Some(labels) = table.labels.get(&series_ref) {
            return SeriesLookup::Found {
                labels: labels.clone(),
                metadata: table.metadata.get(&series_ref).cloned(),
            };
        }
        if table.dropped.contains(&series_ref) {
            return SeriesLookup::DroppedByRelabel;
        }
        SeriesLookup::Unknown {
            first_sighting: table.reported_unknown.insert(series_ref),
        }
    }

    /// Releases every interned string still held. Called on shutdown.
    pub fn release_all(&self) {
        let mut table = self.series.lock();
        for labels in table.labels.values() {
            self.release_labels(labels);
        }
        table.labels.clear();
        table.metadata.clear();
        table.dropped.clear();
    }

    fn intern_labels(&self, labels: &Labels) {
        for label in labels.iter() {
            self.interner.intern(&label.name);
            self.interner.intern(&label.value);
        }
    }

    fn release_labels(&self, labels: &Labels) {
        for label in labels.iter() {
            self.interner.release(&label.name);
            self.interner.release(&label.value);
        }
    }
}
