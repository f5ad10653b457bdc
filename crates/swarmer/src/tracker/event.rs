/// The event of an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Event {
    /// A regular announce, sent at the interval of the tracker.
    None = 0,
    Completed = 1,
    #[default]
    Started = 2,
    Stopped = 3,
}

impl Event {
    /// Value of the `event` query parameter of HTTP trackers, regular
    /// announces don't send one.
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            Event::None => None,
            Event::Completed => Some("completed"),
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
        }
    }
}

impl From<Event> for u32 {
    fn from(value: Event) -> Self {
        value as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values() {
        assert_eq!(u32::from(Event::None), 0);
        assert_eq!(u32::from(Event::Completed), 1);
        assert_eq!(u32::from(Event::Started), 2);
        assert_eq!(u32::from(Event::Stopped), 3);
        assert_eq!(Event::None.as_str(), None);
        assert_eq!(Event::Stopped.as_str(), Some("stopped"));
    }
}
