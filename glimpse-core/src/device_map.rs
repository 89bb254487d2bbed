use std::str::FromStr;

/// Where model weights are placed when a backend is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl FromStr for DeviceMap {
    type Err = String;

    /// Accepts `cpu` or a GPU ordinal such as `0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("cpu") {
            return Ok(Self::ForceCpu);
        }
        s.parse::<usize>()
            .map(Self::Ordinal)
            .map_err(|_| format!("expected `cpu` or a device ordinal, got `{s}`"))
    }
}
