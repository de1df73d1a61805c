// Broker status bit flags and their pure transformations.
//
// Status is kept as documented bit algebra rather than an enum: the pairing
// rules (UP implies LINK_UP, DOWN forces LINK_DOWN) only make sense on bits.
use std::fmt;

/// Bit-set describing the liveness of one broker.
///
/// `BROKER_UP`/`BROKER_DOWN` and `LINK_UP`/`LINK_DOWN` are mutually exclusive
/// pairs; every setter clears the opposite bit of its pair.
///
/// ```
/// use felix_cluster::BrokerStatus;
///
/// let status = BrokerStatus::UNKNOWN.set_up().normalize();
/// assert!(status.is_up());
/// assert!(status.is_link_up());
/// assert_eq!(status.set_down().normalize().to_string(), "DOWN|LINK_DOWN");
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BrokerStatus(u32);

impl BrokerStatus {
    pub const UNKNOWN: Self = Self(0);
    pub const BROKER_UP: Self = Self(1 << 0);
    pub const BROKER_DOWN: Self = Self(1 << 1);
    pub const LINK_UP: Self = Self(1 << 2);
    pub const LINK_DOWN: Self = Self(1 << 3);
    pub const IN_DOUBT: Self = Self(1 << 4);
    pub const ACTIVATED: Self = Self(1 << 5);

    /// Value assigned when a broker is activated.
    pub const ACTIVATE_BROKER: Self =
        Self(Self::BROKER_UP.0 | Self::LINK_UP.0 | Self::ACTIVATED.0);
    /// Synthetic prior value used for updates from a superseded session.
    pub const BROKER_INDOUBT: Self = Self(Self::BROKER_UP.0 | Self::LINK_UP.0 | Self::IN_DOUBT.0);

    const ALL: u32 = (1 << 6) - 1;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    const fn with(self, set: Self, clear: Self) -> Self {
        Self((self.0 & !clear.0) | set.0)
    }

    pub const fn set_up(self) -> Self {
        self.with(Self::BROKER_UP, Self::BROKER_DOWN)
    }

    pub const fn set_down(self) -> Self {
        self.with(Self::BROKER_DOWN, Self::BROKER_UP)
    }

    pub const fn set_link_up(self) -> Self {
        self.with(Self::LINK_UP, Self::LINK_DOWN)
    }

    pub const fn set_link_down(self) -> Self {
        self.with(Self::LINK_DOWN, Self::LINK_UP)
    }

    pub const fn set_in_doubt(self) -> Self {
        self.with(Self::IN_DOUBT, Self::UNKNOWN)
    }

    pub const fn set_not_in_doubt(self) -> Self {
        self.with(Self::UNKNOWN, Self::IN_DOUBT)
    }

    pub const fn set_activated(self) -> Self {
        self.set_up()
            .set_link_up()
            .with(Self::ACTIVATED, Self::IN_DOUBT)
    }

    pub const fn set_deactivated(self) -> Self {
        self.with(Self::UNKNOWN, Self::ACTIVATED)
    }

    /// Apply the pairing rule used on every mutation.
    ///
    /// Brokers in this cluster have no separate process/link distinction, so
    /// DOWN and LINK_DOWN imply each other, as do UP and LINK_UP. Down wins
    /// over up when both halves are present.
    pub const fn normalize(self) -> Self {
        if self.is_down() || self.is_link_down() {
            self.set_down().set_link_down()
        } else if self.is_up() || self.is_link_up() {
            self.set_up().set_link_up()
        } else {
            self
        }
    }

    pub const fn is_up(self) -> bool {
        self.contains(Self::BROKER_UP)
    }

    pub const fn is_down(self) -> bool {
        self.contains(Self::BROKER_DOWN)
    }

    pub const fn is_link_up(self) -> bool {
        self.contains(Self::LINK_UP)
    }

    pub const fn is_link_down(self) -> bool {
        self.contains(Self::LINK_DOWN)
    }

    pub const fn is_in_doubt(self) -> bool {
        self.contains(Self::IN_DOUBT)
    }

    pub const fn is_activated(self) -> bool {
        self.contains(Self::ACTIVATED)
    }
}

impl std::ops::BitOr for BrokerStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for BrokerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(BrokerStatus, &str); 6] = [
            (BrokerStatus::BROKER_UP, "UP"),
            (BrokerStatus::BROKER_DOWN, "DOWN"),
            (BrokerStatus::LINK_UP, "LINK_UP"),
            (BrokerStatus::LINK_DOWN, "LINK_DOWN"),
            (BrokerStatus::IN_DOUBT, "IN_DOUBT"),
            (BrokerStatus::ACTIVATED, "ACTIVATED"),
        ];
        if self.0 & Self::ALL == 0 {
            return f.write_str("UNKNOWN");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}
