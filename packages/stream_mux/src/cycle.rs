//! Ordered set of channels rotated through on a shared connection.

/// Distinct requested channels in first-seen order, plus the one currently
/// selected upstream.
#[derive(Debug, Clone, Default)]
pub struct ChannelCycle {
    members: Vec<String>,
    current: Option<String>,
}

impl ChannelCycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute membership from the live subscribers' channels.
    ///
    /// Returns true if membership or order changed. The current selection is
    /// kept even if it is no longer a member; callers decide whether to move.
    pub fn rebuild<'a>(&mut self, requested: impl IntoIterator<Item = &'a str>) -> bool {
        let mut members: Vec<String> = Vec::new();
        for channel in requested {
            if !members.iter().any(|m| m == channel) {
                members.push(channel.to_string());
            }
        }
        let changed = members != self.members;
        self.members = members;
        changed
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.members.iter().any(|m| m == channel)
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Whether the current selection is still a member.
    pub fn current_is_member(&self) -> bool {
        self.current.as_deref().is_some_and(|c| self.contains(c))
    }

    /// Only multi-member cycles rotate on a timer.
    pub fn rotates(&self) -> bool {
        self.members.len() > 1
    }

    /// Select the first member.
    pub fn restart(&mut self) -> Option<&str> {
        self.current = self.members.first().cloned();
        self.current.as_deref()
    }

    /// Keep the current selection if it is still a member, else the first.
    pub fn resume(&mut self) -> Option<&str> {
        if !self.current_is_member() {
            self.current = self.members.first().cloned();
        }
        self.current.as_deref()
    }

    /// Select the member after the current one, wrapping around.
    pub fn advance(&mut self) -> Option<&str> {
        let next = match self
            .current
            .as_deref()
            .and_then(|c| self.members.iter().position(|m| m == c))
        {
            Some(idx) => self.members.get((idx + 1) % self.members.len()),
            None => self.members.first(),
        };
        self.current = next.cloned();
        self.current.as_deref()
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.current = None;
    }
}
