//! Proposed layouts handed to the metadata manager.
//!
//! Units in a proposal carry temporary ("fake") ids; the manager translates
//! them to real ids when it persists the layout. Fake ids never reach the
//! coordination store.

use crate::replica::round_robin;
use polystore_common::{ColumnsRange, IdGenerator, KEY_MAX, KeyInterval, StorageEngineId};

/// A replica inside a proposed storage unit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaPlan {
    pub fake_id: String,
    pub storage_engine_id: StorageEngineId,
}

/// A proposed master storage unit and its replicas
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageUnitPlan {
    pub fake_id: String,
    pub storage_engine_id: StorageEngineId,
    pub replicas: Vec<ReplicaPlan>,
}

/// A proposed fragment bound to a proposed unit by fake id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentPlan {
    pub columns: ColumnsRange,
    pub keys: KeyInterval,
    pub storage_unit: String,
}

/// Units and fragments proposed together
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LayoutPlan {
    pub storage_units: Vec<StorageUnitPlan>,
    pub fragments: Vec<FragmentPlan>,
}

impl LayoutPlan {
    fn push(
        &mut self,
        id_gen: &IdGenerator,
        columns: ColumnsRange,
        keys: KeyInterval,
        engines: &[StorageEngineId],
    ) {
        let Some((&master, replicas)) = engines.split_first() else {
            return;
        };
        let fake_id = id_gen.next_named("fake");
        self.storage_units.push(StorageUnitPlan {
            fake_id: fake_id.clone(),
            storage_engine_id: master,
            replicas: replicas
                .iter()
                .map(|&engine| ReplicaPlan {
                    fake_id: id_gen.next_named("fake"),
                    storage_engine_id: engine,
                })
                .collect(),
        });
        self.fragments.push(FragmentPlan {
            columns,
            keys,
            storage_unit: fake_id,
        });
    }
}

/// Naive initial layout: split the columns space at sampled paths
#[derive(Clone, Copy, Debug)]
pub struct InitialLayoutPlanner {
    replica_num: usize,
}

impl InitialLayoutPlanner {
    #[must_use]
    pub const fn new(replica_num: usize) -> Self {
        Self { replica_num }
    }

    /// Tiling of the whole space for a first write covering `keys`
    ///
    /// Keys before `keys.start()` get one fragment spanning every column.
    /// From `keys.start()` on, the columns space is cut at up to
    /// `engines.len()` of the sorted `paths`, plus the two unbounded edges.
    #[must_use]
    pub fn plan_initial(
        &self,
        paths: &[String],
        keys: KeyInterval,
        engines: &[StorageEngineId],
        id_gen: &IdGenerator,
    ) -> LayoutPlan {
        let mut plan = LayoutPlan::default();
        let mut index = 0;
        if keys.start() != 0 {
            plan.push(
                id_gen,
                ColumnsRange::unbounded(),
                KeyInterval::new(0, keys.start()),
                &self.engines_for(engines, index),
            );
            index += 1;
        }
        self.plan_from(&mut plan, paths, keys.start(), engines, index, id_gen);
        plan
    }

    /// A new generation starting at `start_key`, tiling the columns space
    #[must_use]
    pub fn plan_generation(
        &self,
        paths: &[String],
        start_key: i64,
        engines: &[StorageEngineId],
        id_gen: &IdGenerator,
    ) -> LayoutPlan {
        let mut plan = LayoutPlan::default();
        self.plan_from(&mut plan, paths, start_key, engines, 0, id_gen);
        plan
    }

    fn plan_from(
        &self,
        plan: &mut LayoutPlan,
        paths: &[String],
        start_key: i64,
        engines: &[StorageEngineId],
        mut index: usize,
        id_gen: &IdGenerator,
    ) {
        let open = KeyInterval::new(start_key, KEY_MAX);
        let mut paths = paths.to_vec();
        paths.sort();
        paths.dedup();
        let (Some(first), Some(last)) = (paths.first().cloned(), paths.last().cloned()) else {
            plan.push(id_gen, ColumnsRange::unbounded(), open, &self.engines_for(engines, index));
            return;
        };

        let split_num = engines.len().min(paths.len() - 1);
        for i in 0..split_num {
            let lower = &paths[i * (paths.len() - 1) / split_num];
            let upper = &paths[(i + 1) * (paths.len() - 1) / split_num];
            plan.push(
                id_gen,
                ColumnsRange::bounded(lower.as_str(), upper.as_str()),
                open,
                &self.engines_for(engines, index),
            );
            index += 1;
        }
        plan.push(
            id_gen,
            ColumnsRange::new(Some(last), None::<String>),
            open,
            &self.engines_for(engines, index),
        );
        index += 1;
        plan.push(
            id_gen,
            ColumnsRange::new(None::<String>, Some(first)),
            open,
            &self.engines_for(engines, index),
        );
    }

    fn engines_for(&self, engines: &[StorageEngineId], index: usize) -> Vec<StorageEngineId> {
        round_robin(engines, index, 1 + self.replica_num)
    }
}
