use serde::Deserialize;

/// A coarse description of the current network connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkClass {
    Offline,
    MeteredFast,
    UnmeteredFast,
    #[default]
    Unknown,
}

impl NetworkClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkClass::Offline => "offline",
            NetworkClass::MeteredFast => "metered-fast",
            NetworkClass::UnmeteredFast => "unmetered-fast",
            NetworkClass::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for NetworkClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(NetworkClass::Offline),
            "metered-fast" => Ok(NetworkClass::MeteredFast),
            "unmetered-fast" => Ok(NetworkClass::UnmeteredFast),
            "unknown" => Ok(NetworkClass::Unknown),
            _ => Err(format!("unknown network class `{s}`")),
        }
    }
}

/// Maps the [`NetworkClass`] to the number of download workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizer {
    max_workers: usize,
}

impl PoolSizer {
    /// Creates a sizer allowing `max_workers` concurrent downloads on the best networks.
    ///
    /// At least one worker is always allowed.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn workers_for(&self, class: NetworkClass) -> usize {
        match class {
            NetworkClass::UnmeteredFast => self.max_workers,
            NetworkClass::MeteredFast => (self.max_workers / 2).max(1),
            NetworkClass::Offline | NetworkClass::Unknown => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workers_for() {
        let sizer = PoolSizer::new(4);
        assert_eq!(sizer.workers_for(NetworkClass::UnmeteredFast), 4);
        assert_eq!(sizer.workers_for(NetworkClass::MeteredFast), 2);
        assert_eq!(sizer.workers_for(NetworkClass::Offline), 1);
        assert_eq!(sizer.workers_for(NetworkClass::Unknown), 1);

        let sizer = PoolSizer::new(5);
        assert_eq!(sizer.workers_for(NetworkClass::MeteredFast), 2);

        let sizer = PoolSizer::new(1);
        assert_eq!(sizer.workers_for(NetworkClass::MeteredFast), 1);

        let sizer = PoolSizer::new(0);
        assert_eq!(sizer.max_workers(), 1);
        assert_eq!(sizer.workers_for(NetworkClass::UnmeteredFast), 1);
    }

    #[test]
    fn test_parse_network_class() {
        for class in [
            NetworkClass::Offline,
            NetworkClass::MeteredFast,
            NetworkClass::UnmeteredFast,
            NetworkClass::Unknown,
        ] {
            assert_eq!(class.as_str().parse::<NetworkClass>(), Ok(class));
        }
        assert!("wifi".parse::<NetworkClass>().is_err());
    }
}
