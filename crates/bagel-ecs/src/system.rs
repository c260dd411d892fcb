//! Systems run on the primary thread against the whole world.
//!
//! A system registers its queries in [`System::init`] when it is added and
//! then runs once per [`World::update_systems`] while enabled. Systems run in
//! registration order.

use std::fmt;

use crate::world::World;
use crate::EcsError;

/// Logic run by the world on every update.
pub trait System: Send {
    fn name(&self) -> &str;

    /// Called once when the system is added. Register queries here.
    fn init(&mut self, _world: &mut World) -> Result<(), EcsError> {
        Ok(())
    }

    fn update(&mut self, world: &mut World) -> Result<(), EcsError>;
}

/// Handle to a system added to a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(pub u32);

struct SystemEntry {
    /// `None` while the system is running.
    system: Option<Box<dyn System>>,
    name: String,
    enabled: bool,
}

/// Every local system of a world, in registration order.
#[derive(Default)]
pub struct Systems {
    entries: Vec<SystemEntry>,
}

impl Systems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered systems, enabled or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn push(&mut self, system: Box<dyn System>) -> SystemId {
        let id = SystemId(self.entries.len() as u32);
        self.entries.push(SystemEntry {
            name: system.name().to_owned(),
            system: Some(system),
            enabled: true,
        });
        id
    }

    fn entry(&self, id: SystemId) -> Result<&SystemEntry, EcsError> {
        self.entries
            .get(id.0 as usize)
            .ok_or(EcsError::UnknownSystem { id: id.0 })
    }

    fn entry_mut(&mut self, id: SystemId) -> Result<&mut SystemEntry, EcsError> {
        self.entries
            .get_mut(id.0 as usize)
            .ok_or(EcsError::UnknownSystem { id: id.0 })
    }

    pub fn name(&self, id: SystemId) -> Result<&str, EcsError> {
        Ok(&self.entry(id)?.name)
    }

    pub fn is_enabled(&self, id: SystemId) -> Result<bool, EcsError> {
        Ok(self.entry(id)?.enabled)
    }

    pub(crate) fn set_enabled(&mut self, id: SystemId, enabled: bool) -> Result<(), EcsError> {
        self.entry_mut(id)?.enabled = enabled;
        Ok(())
    }

    /// Ids of enabled systems in run order.
    pub(crate) fn enabled(&self) -> Vec<SystemId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.enabled)
            .map(|(i, _)| SystemId(i as u32))
            .collect()
    }

    /// Take a system out to run it against the world. A system that is
    /// already running (a nested update) yields `None`.
    pub(crate) fn take(&mut self, id: SystemId) -> Result<Option<Box<dyn System>>, EcsError> {
        Ok(self.entry_mut(id)?.system.take())
    }

    pub(crate) fn restore(&mut self, id: SystemId, system: Box<dyn System>) {
        if let Some(entry) = self.entries.get_mut(id.0 as usize) {
            entry.system = Some(system);
        }
    }
}

impl fmt::Debug for Systems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (&e.name, e.enabled)))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentId;
    use crate::query::{QueryId, QueryModifier};
    use crate::storage::StorageTypeId;
    use crate::value::Value;

    /// Adds `step` to `counter` on every entity that has it.
    struct Tick {
        label: &'static str,
        step: f64,
        counter: ComponentId,
        query: Option<QueryId>,
    }

    impl Tick {
        fn new(label: &'static str, counter: ComponentId, step: f64) -> Self {
            Self {
                label,
                step,
                counter,
                query: None,
            }
        }
    }

    impl System for Tick {
        fn name(&self) -> &str {
            self.label
        }

        fn init(&mut self, world: &mut World) -> Result<(), EcsError> {
            self.query = Some(world.register_query(QueryModifier::with([self.counter])));
            Ok(())
        }

        fn update(&mut self, world: &mut World) -> Result<(), EcsError> {
            let Some(query) = self.query else {
                return Ok(());
            };
            let (counter, step) = (self.counter, self.step);
            world.for_each(query, |world, e| world.increment(e, counter, step))
        }
    }

    /// Doubles the counter, so run order is observable.
    struct Double(ComponentId);

    impl System for Double {
        fn name(&self) -> &str {
            "double"
        }

        fn update(&mut self, world: &mut World) -> Result<(), EcsError> {
            let counter = self.0;
            for e in world.query(QueryModifier::with([counter])) {
                world.multiply(e, counter, 2.0)?;
            }
            Ok(())
        }
    }

    struct Broken;

    impl System for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn update(&mut self, _world: &mut World) -> Result<(), EcsError> {
            Err(EcsError::Executor("broken system".into()))
        }
    }

    fn counter_world() -> (World, ComponentId) {
        let mut world = World::new(8);
        let counter = world
            .registry_mut()
            .register_value("counter", StorageTypeId::F64)
            .unwrap();
        (world, counter)
    }

    #[test]
    fn systems_run_in_registration_order() {
        let (mut world, counter) = counter_world();
        let e = world.spawn_with([(counter, 1.0)]).unwrap();
        world.add_system(Tick::new("tick", counter, 1.0)).unwrap();
        world.add_system(Double(counter)).unwrap();

        world.update_systems().unwrap();
        assert_eq!(world.get(e, counter).unwrap(), Value::Number(4.0));
        world.update_systems().unwrap();
        assert_eq!(world.get(e, counter).unwrap(), Value::Number(10.0));
        assert_eq!(world.systems().len(), 2);
    }

    #[test]
    fn disabled_systems_are_skipped_until_enabled() {
        let (mut world, counter) = counter_world();
        let e = world.spawn_with([(counter, 0.0)]).unwrap();
        let tick = world.add_system(Tick::new("tick", counter, 5.0)).unwrap();
        assert!(world.systems().is_enabled(tick).unwrap());

        world.disable_system(tick).unwrap();
        world.update_systems().unwrap();
        assert_eq!(world.get(e, counter).unwrap(), Value::Number(0.0));

        world.enable_system(tick).unwrap();
        world.update_systems().unwrap();
        assert_eq!(world.get(e, counter).unwrap(), Value::Number(5.0));
        assert_eq!(world.systems().name(tick).unwrap(), "tick");
    }

    #[test]
    fn queries_registered_in_init_see_later_entities() {
        let (mut world, counter) = counter_world();
        world.add_system(Tick::new("tick", counter, 1.0)).unwrap();
        let late = world.spawn_with([(counter, 10.0)]).unwrap();
        world.update_systems().unwrap();
        assert_eq!(world.get(late, counter).unwrap(), Value::Number(11.0));
    }

    #[test]
    fn failing_system_stops_the_update_and_stays_registered() {
        let (mut world, counter) = counter_world();
        let e = world.spawn_with([(counter, 1.0)]).unwrap();
        let broken = world.add_system(Broken).unwrap();
        world.add_system(Double(counter)).unwrap();

        assert!(matches!(world.update_systems(), Err(EcsError::Executor(_))));
        assert_eq!(world.get(e, counter).unwrap(), Value::Number(1.0));

        world.disable_system(broken).unwrap();
        world.update_systems().unwrap();
        assert_eq!(world.get(e, counter).unwrap(), Value::Number(2.0));
    }

    #[test]
    fn unknown_system_ids_are_errors() {
        let (mut world, _) = counter_world();
        assert!(matches!(
            world.enable_system(SystemId(3)),
            Err(EcsError::UnknownSystem { id: 3 })
        ));
    }
}
