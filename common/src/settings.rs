use crate::{
    config::{ActuatorSettings, PersistedSettings, SettingsUpdate},
    error::{ControllerError, StoreError},
    record,
    types::ActuatorId,
};

/// Durable key-value blob backing the settings record.
pub trait ConfigStore {
    /// `Ok(None)` means nothing has been written yet.
    fn read_record(&mut self) -> Result<Option<Vec<u8>>, StoreError>;
    fn write_record(&mut self, bytes: &[u8]) -> Result<(), StoreError>;
}

/// In-process store, used by tests and as a fallback when no durable
/// medium is available.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    record: Option<Vec<u8>>,
    fail_writes: bool,
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(bytes: Vec<u8>) -> Self {
        Self {
            record: Some(bytes),
            ..Self::default()
        }
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn record(&self) -> Option<&[u8]> {
        self.record.as_deref()
    }

    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl ConfigStore for MemoryStore {
    fn read_record(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.record.clone())
    }

    fn write_record(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Backend("write rejected".to_string()));
        }
        self.record = Some(bytes.to_vec());
        self.writes += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Stored,
    Defaults,
}

/// Canonical in-memory settings plus the store they persist to. The
/// in-memory copy stays authoritative for the session even when a write
/// fails.
#[derive(Debug)]
pub struct SettingsModel<S> {
    store: S,
    settings: PersistedSettings,
}

impl<S: ConfigStore> SettingsModel<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            settings: PersistedSettings::default(),
        }
    }

    /// Reads the record. An uninitialized store yields defaults, which are
    /// written back so the next boot finds a valid record. A read error also
    /// leaves defaults in place but is reported and nothing is written.
    pub fn load(&mut self) -> Result<LoadSource, StoreError> {
        let stored = match self.store.read_record() {
            Ok(stored) => stored,
            Err(err) => {
                self.settings = PersistedSettings::default();
                return Err(err);
            }
        };

        match stored.as_deref().and_then(record::decode) {
            Some(settings) => {
                self.settings = settings;
                Ok(LoadSource::Stored)
            }
            None => {
                self.settings = PersistedSettings::default();
                self.save()?;
                Ok(LoadSource::Defaults)
            }
        }
    }

    pub fn save(&mut self) -> Result<(), StoreError> {
        self.store.write_record(&record::encode(&self.settings))
    }

    /// Replaces every field and persists.
    pub fn replace(&mut self, mut settings: PersistedSettings) -> Result<(), StoreError> {
        settings.sanitize();
        self.settings = settings;
        self.save()
    }

    /// Merges the present fields and saves if anything changed. Invalid input
    /// leaves the settings untouched. A storage error is returned after the
    /// merge has already been applied in memory.
    pub fn update(&mut self, update: &SettingsUpdate) -> Result<bool, ControllerError> {
        let changed = self.settings.apply(update)?;
        if changed {
            self.save()?;
        }
        Ok(changed)
    }

    pub fn settings(&self) -> &PersistedSettings {
        &self.settings
    }

    pub fn get(&self, id: ActuatorId) -> &ActuatorSettings {
        self.settings.get(id)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActuatorSettingsPatch;
    use pretty_assertions::assert_eq;

    struct BrokenStore;

    impl ConfigStore for BrokenStore {
        fn read_record(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Backend("flash unreadable".to_string()))
        }

        fn write_record(&mut self, _bytes: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::Backend("flash unwritable".to_string()))
        }
    }

    fn custom() -> PersistedSettings {
        let mut settings = PersistedSettings::default();
        settings.actuators[0].on_duration_minutes = 10;
        settings.actuators[1].schedule_hour = 6;
        settings.actuators[1].schedule_minute = 45;
        settings.actuators[2].schedule_enabled = true;
        settings
    }

    #[test]
    fn empty_store_loads_defaults_and_writes_them_back() {
        let mut model = SettingsModel::new(MemoryStore::new());
        assert_eq!(model.load().unwrap(), LoadSource::Defaults);
        assert_eq!(*model.settings(), PersistedSettings::default());
        assert_eq!(model.store().writes(), 1);
        assert_eq!(
            record::decode(model.store().record().unwrap()),
            Some(PersistedSettings::default())
        );
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut model = SettingsModel::new(MemoryStore::new());
        model.replace(custom()).unwrap();

        let store = model.store().clone();
        let mut reloaded = SettingsModel::new(store);
        assert_eq!(reloaded.load().unwrap(), LoadSource::Stored);
        assert_eq!(*reloaded.settings(), custom());
    }

    #[test]
    fn round_trip_holds_for_boundary_values() {
        for minutes in [1, 59, 1_440, u32::MAX] {
            for (hour, minute) in [(0, 0), (23, 59), (12, 30)] {
                for enabled in [false, true] {
                    let mut settings = PersistedSettings::default();
                    for slot in &mut settings.actuators {
                        *slot = ActuatorSettings {
                            on_duration_minutes: minutes,
                            schedule_hour: hour,
                            schedule_minute: minute,
                            schedule_enabled: enabled,
                        };
                    }

                    let mut model = SettingsModel::new(MemoryStore::new());
                    model.replace(settings).unwrap();
                    let mut reloaded = SettingsModel::new(model.store().clone());
                    reloaded.load().unwrap();
                    assert_eq!(*reloaded.settings(), settings);
                }
            }
        }
    }

    #[test]
    fn corrupt_record_falls_back_to_defaults() {
        let mut model = SettingsModel::new(MemoryStore::with_record(vec![0xFF; 25]));
        assert_eq!(model.load().unwrap(), LoadSource::Defaults);
        assert_eq!(*model.settings(), PersistedSettings::default());
    }

    #[test]
    fn read_failure_keeps_defaults_and_reports() {
        let mut model = SettingsModel::new(BrokenStore);
        assert!(model.load().is_err());
        assert_eq!(*model.settings(), PersistedSettings::default());
    }

    #[test]
    fn update_saves_only_when_something_changed() {
        let mut model = SettingsModel::new(MemoryStore::new());
        model.load().unwrap();
        let baseline = model.store().writes();

        let same = SettingsUpdate {
            actuators: vec![ActuatorSettingsPatch {
                id: 1,
                on_time_minutes: Some(1),
                ..Default::default()
            }],
        };
        assert!(!model.update(&same).unwrap());
        assert_eq!(model.store().writes(), baseline);

        let different = SettingsUpdate {
            actuators: vec![ActuatorSettingsPatch {
                id: 3,
                schedule_enabled: Some(true),
                ..Default::default()
            }],
        };
        assert!(model.update(&different).unwrap());
        assert_eq!(model.store().writes(), baseline + 1);
        assert!(model.get(ActuatorId::THREE).schedule_enabled);
    }

    #[test]
    fn failed_write_keeps_merged_values_in_memory() {
        let mut model = SettingsModel::new(MemoryStore::new());
        model.load().unwrap();
        model.store_mut().set_fail_writes(true);

        let update = SettingsUpdate {
            actuators: vec![ActuatorSettingsPatch {
                id: 2,
                on_time_minutes: Some(9),
                ..Default::default()
            }],
        };
        assert!(matches!(
            model.update(&update),
            Err(ControllerError::Storage(_))
        ));
        assert_eq!(model.get(ActuatorId::TWO).on_duration_minutes, 9);
    }

    #[test]
    fn invalid_update_changes_nothing_and_skips_save() {
        let mut model = SettingsModel::new(MemoryStore::new());
        model.replace(custom()).unwrap();
        let writes = model.store().writes();

        let update = SettingsUpdate {
            actuators: vec![ActuatorSettingsPatch {
                id: 1,
                on_time_minutes: Some(0),
                ..Default::default()
            }],
        };
        assert!(model.update(&update).is_err());
        assert_eq!(*model.settings(), custom());
        assert_eq!(model.store().writes(), writes);
    }
}
