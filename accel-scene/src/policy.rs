use strum::IntoStaticStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "kebab_case")]
pub enum RebuildReason {
    GeometryBuilt,
    GeometryCompacted,
    InstanceCountGrew,
    InstanceCountChanged,
    InstancesChanged,
    NoTopLevel,
    Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopLevelAction {
    /// No usable instances, so no top level structure this frame.
    #[default]
    None,
    Rebuild(RebuildReason),
    Update,
}

/// What changed since the last top level build.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTopology {
    pub groups_built: usize,
    pub groups_compacted: usize,
    pub active_instances: usize,
    pub previous_active_instances: usize,
    /// Instance count of the current top level structure, if there is one.
    pub top_level_instances: Option<usize>,
    /// The usable instances, or the structures they reference, differ from
    /// those the current top level structure was built over.
    pub instances_changed: bool,
}

/// Chooses between rebuilding and refitting the top level structure.
///
/// Refits are cheap but only move instances; anything that changes the set
/// of referenced structures needs a rebuild, and a rebuild is forced after
/// `budget` refits in a row to bound the quality loss they accumulate.
#[derive(Debug, Clone)]
pub struct RebuildPolicy {
    budget: u32,
    frames_before_rebuild: u32,
}

impl RebuildPolicy {
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            frames_before_rebuild: budget,
        }
    }

    pub fn frames_before_rebuild(&self) -> u32 {
        self.frames_before_rebuild
    }

    pub fn decide(&mut self, topology: &FrameTopology) -> TopLevelAction {
        if topology.active_instances == 0 {
            return TopLevelAction::None;
        }
        let reason = if topology.groups_built != 0 {
            Some(RebuildReason::GeometryBuilt)
        } else if topology.groups_compacted != 0 {
            Some(RebuildReason::GeometryCompacted)
        } else if topology.active_instances > topology.previous_active_instances {
            Some(RebuildReason::InstanceCountGrew)
        } else if topology.top_level_instances.is_none() {
            Some(RebuildReason::NoTopLevel)
        } else if topology.top_level_instances != Some(topology.active_instances) {
            Some(RebuildReason::InstanceCountChanged)
        } else if topology.instances_changed {
            Some(RebuildReason::InstancesChanged)
        } else {
            self.frames_before_rebuild = self.frames_before_rebuild.saturating_sub(1);
            if self.frames_before_rebuild == 0 {
                Some(RebuildReason::Periodic)
            } else {
                None
            }
        };
        match reason {
            Some(reason) => {
                self.frames_before_rebuild = self.budget;
                TopLevelAction::Rebuild(reason)
            }
            None => TopLevelAction::Update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady(count: usize) -> FrameTopology {
        FrameTopology {
            active_instances: count,
            previous_active_instances: count,
            top_level_instances: Some(count),
            ..Default::default()
        }
    }

    #[test]
    fn empty_scene_does_nothing() {
        let mut policy = RebuildPolicy::new(10);
        for _ in 0..5 {
            assert_eq!(policy.decide(&FrameTopology::default()), TopLevelAction::None);
        }
        assert_eq!(policy.frames_before_rebuild(), 10);
    }

    #[test]
    fn periodic_rebuild_after_budget() {
        let mut policy = RebuildPolicy::new(10);
        let first = FrameTopology {
            groups_built: 3,
            active_instances: 5,
            ..Default::default()
        };
        assert_eq!(
            policy.decide(&first),
            TopLevelAction::Rebuild(RebuildReason::GeometryBuilt)
        );
        assert_eq!(policy.frames_before_rebuild(), 10);

        for expected in (1..10).rev() {
            assert_eq!(policy.decide(&steady(5)), TopLevelAction::Update);
            assert_eq!(policy.frames_before_rebuild(), expected);
        }
        assert_eq!(
            policy.decide(&steady(5)),
            TopLevelAction::Rebuild(RebuildReason::Periodic)
        );
        assert_eq!(policy.frames_before_rebuild(), 10);
    }

    #[test]
    fn growth_forces_rebuild() {
        let mut policy = RebuildPolicy::new(10);
        policy.decide(&steady(5));
        let grown = FrameTopology {
            active_instances: 6,
            previous_active_instances: 5,
            top_level_instances: Some(5),
            ..Default::default()
        };
        assert_eq!(
            policy.decide(&grown),
            TopLevelAction::Rebuild(RebuildReason::InstanceCountGrew)
        );
        assert_eq!(policy.frames_before_rebuild(), 10);
    }

    #[test]
    fn shrinkage_forces_rebuild() {
        let mut policy = RebuildPolicy::new(10);
        let shrunk = FrameTopology {
            active_instances: 3,
            previous_active_instances: 5,
            top_level_instances: Some(5),
            ..Default::default()
        };
        assert_eq!(
            policy.decide(&shrunk),
            TopLevelAction::Rebuild(RebuildReason::InstanceCountChanged)
        );
    }

    #[test]
    fn missing_top_level_forces_rebuild() {
        let mut policy = RebuildPolicy::new(10);
        let topology = FrameTopology {
            active_instances: 2,
            previous_active_instances: 2,
            ..Default::default()
        };
        assert_eq!(
            policy.decide(&topology),
            TopLevelAction::Rebuild(RebuildReason::NoTopLevel)
        );
    }

    #[test]
    fn replaced_instances_force_rebuild() {
        let mut policy = RebuildPolicy::new(10);
        policy.decide(&steady(4));
        let swapped = FrameTopology {
            instances_changed: true,
            ..steady(4)
        };
        assert_eq!(
            policy.decide(&swapped),
            TopLevelAction::Rebuild(RebuildReason::InstancesChanged)
        );
        assert_eq!(policy.frames_before_rebuild(), 10);
        assert_eq!(policy.decide(&steady(4)), TopLevelAction::Update);
    }

    #[test]
    fn counter_never_underflows() {
        for budget in 0..4 {
            let mut policy = RebuildPolicy::new(budget);
            for _ in 0..20 {
                let action = policy.decide(&steady(1));
                assert!(policy.frames_before_rebuild() <= budget);
                if budget <= 1 {
                    assert!(matches!(action, TopLevelAction::Rebuild(_)));
                }
            }
        }
    }

    #[test]
    fn reasons_have_names() {
        let name: &'static str = RebuildReason::InstanceCountGrew.into();
        assert_eq!(name, "instance-count-grew");
    }
}
