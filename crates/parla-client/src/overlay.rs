//! Single active overlay slot for menus and modals.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "target", rename_all = "kebab-case")]
pub enum Overlay {
    MessageMenu(String),
    ConversationMenu(String),
    AttachMenu,
    NewChat,
    NewGroup,
    AddContact,
    AddMembers,
    IncomingCall,
}

#[derive(Debug, Default)]
pub struct OverlayRegistry {
    active: Option<Overlay>,
}

impl OverlayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `overlay` as the active one. Returns the overlay it
    /// replaced, which the caller should hide.
    pub fn open(&mut self, overlay: Overlay) -> Option<Overlay> {
        match self.active.replace(overlay) {
            Some(previous) if Some(&previous) == self.active.as_ref() => None,
            previous => previous,
        }
    }

    pub fn close(&mut self, overlay: &Overlay) -> bool {
        if self.active.as_ref() == Some(overlay) {
            self.active = None;
            true
        } else {
            false
        }
    }

    /// A click landed outside the active overlay.
    pub fn outside_click(&mut self) -> Option<Overlay> {
        self.active.take()
    }

    pub fn active(&self) -> Option<&Overlay> {
        self.active.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_replaces_previous() {
        let mut reg = OverlayRegistry::new();
        assert_eq!(reg.open(Overlay::AttachMenu), None);
        assert_eq!(
            reg.open(Overlay::MessageMenu("m1".into())),
            Some(Overlay::AttachMenu)
        );
        assert_eq!(reg.open(Overlay::MessageMenu("m1".into())), None);
        assert_eq!(reg.active(), Some(&Overlay::MessageMenu("m1".into())));
    }

    #[test]
    fn outside_click_closes_active() {
        let mut reg = OverlayRegistry::new();
        reg.open(Overlay::NewGroup);
        assert!(!reg.close(&Overlay::NewChat));
        assert_eq!(reg.outside_click(), Some(Overlay::NewGroup));
        assert_eq!(reg.outside_click(), None);
    }
}
