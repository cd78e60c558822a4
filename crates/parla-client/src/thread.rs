//! The open conversation.
//!
//! `ThreadView` is the render model of one thread: rendered rows, composer
//! state, header and the lock banner. It moves through
//! `Closed -> Loading -> Active -> (Locked | Active) -> Closed`. Every
//! mutation targets a message id and returns `false` when there was nothing
//! to change, so replaying an event is harmless.

use std::collections::HashMap;

use chrono::FixedOffset;
use parla_shared::constants::{
    TEXT_LOCKED_BANNER, TEXT_NO_MESSAGES_YET, TEXT_REPLY_EMPTY, TEXT_REPLY_FILE,
    TEXT_REPLY_UNKNOWN,
};
use parla_shared::{ConversationId, MessageId, UserId};
use parla_store::{Conversation, Message, MessageCache, MessageKind, TickState};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::contacts::ContactBook;
use crate::error::{ClientError, Result};
use crate::render::{
    message_time_label, time_label, tombstone_text, truncate_preview, RenderedAttachment,
    RenderedMessage, ReplyPreview,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreadPhase {
    Closed,
    Loading,
    Active,
    /// History stays visible; composing, reacting and editing are disabled.
    Locked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Composer {
    pub enabled: bool,
    /// Set for the duration of a send.
    pub sending: bool,
    pub reply_to: Option<MessageId>,
    pub editing: Option<MessageId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadHeader {
    pub title: String,
    pub subtitle: String,
    /// Transient "<name> is typing…" label.
    pub typing: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScrollRequest {
    SmoothToBottom,
}

/// Read-only lookups a row needs while it is being built.
pub struct RenderContext<'a> {
    pub local_user: &'a UserId,
    pub contacts: &'a ContactBook,
    pub cache: &'a MessageCache,
    pub conversation: Option<&'a Conversation>,
    pub offset: FixedOffset,
    pub subtitle_max_names: usize,
}

impl RenderContext<'_> {
    fn is_group(&self) -> bool {
        self.conversation.is_some_and(|c| c.is_group)
    }

    fn name_of(&self, user: &UserId) -> String {
        self.contacts.resolve_name(user, self.conversation, None)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadView {
    phase: ThreadPhase,
    conversation_id: Option<ConversationId>,
    nodes: Vec<RenderedMessage>,
    composer: Composer,
    header: ThreadHeader,
    banner: Option<String>,
    scroll: Option<ScrollRequest>,
    /// Tick of every own message, keyed by server id. Only ids present here
    /// are touched by receipt reconciliation.
    ticks: HashMap<MessageId, TickState>,
}

impl Default for ThreadView {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadView {
    pub fn new() -> Self {
        Self {
            phase: ThreadPhase::Closed,
            conversation_id: None,
            nodes: Vec::new(),
            composer: Composer::default(),
            header: ThreadHeader::default(),
            banner: None,
            scroll: None,
            ticks: HashMap::new(),
        }
    }

    pub fn phase(&self) -> ThreadPhase {
        self.phase
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn is_open(&self, id: &ConversationId) -> bool {
        self.conversation_id.as_ref() == Some(id)
    }

    pub fn nodes(&self) -> &[RenderedMessage] {
        &self.nodes
    }

    pub fn node(&self, id: &MessageId) -> Option<&RenderedMessage> {
        self.nodes.iter().find(|n| n.is(id))
    }

    fn node_mut(&mut self, id: &MessageId) -> Option<&mut RenderedMessage> {
        self.nodes.iter_mut().find(|n| n.is(id))
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn header(&self) -> &ThreadHeader {
        &self.header
    }

    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    /// Pending scroll request, cleared once read.
    pub fn take_scroll(&mut self) -> Option<ScrollRequest> {
        self.scroll.take()
    }

    pub fn tick(&self, id: &MessageId) -> Option<TickState> {
        self.ticks.get(id).copied()
    }

    pub fn registered_ticks(&self) -> Vec<MessageId> {
        self.ticks.keys().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start loading `id`. Returns the conversation that was open before.
    pub fn open(&mut self, id: ConversationId) -> Option<ConversationId> {
        let previous = self.close();
        debug!(conversation = %id.short(), "Opening thread");
        self.phase = ThreadPhase::Loading;
        self.conversation_id = Some(id);
        previous
    }

    /// Finish loading with the cached conversation and its history.
    /// Messages rendered while loading keep their place after the history.
    ///
    /// Returns `false` if another conversation was opened in the meantime.
    /// A group the local user is no longer part of opens straight into
    /// [`ThreadPhase::Locked`].
    pub fn activate(
        &mut self,
        conversation: &Conversation,
        history: &[Message],
        ctx: &RenderContext<'_>,
    ) -> bool {
        if self.phase != ThreadPhase::Loading || !self.is_open(&conversation.id) {
            return false;
        }
        self.refresh_header(ctx);
        self.phase = ThreadPhase::Active;
        self.composer = Composer {
            enabled: true,
            ..Composer::default()
        };

        // Rows that arrived live while loading go after the history.
        let live = std::mem::take(&mut self.nodes);
        for message in history {
            self.render(message, ctx);
        }
        for row in live {
            let shown = row.message_id.as_ref().is_some_and(|id| self.node(id).is_some());
            if !shown {
                self.push(row);
            }
        }
        if self.nodes.is_empty() {
            self.append_system(TEXT_NO_MESSAGES_YET);
        }

        if conversation.is_group && !conversation.am_i_member {
            self.lock();
        }
        true
    }

    /// Lock the open thread. Terminal until [`ThreadView::close`].
    pub fn lock(&mut self) -> bool {
        if !matches!(self.phase, ThreadPhase::Active | ThreadPhase::Loading) {
            return false;
        }
        self.phase = ThreadPhase::Locked;
        self.composer = Composer::default();
        self.banner = Some(TEXT_LOCKED_BANNER.to_string());
        true
    }

    /// Close the thread and forget every row. Returns the closed id.
    pub fn close(&mut self) -> Option<ConversationId> {
        let previous = self.conversation_id.take();
        *self = Self::new();
        previous
    }

    pub fn refresh_header(&mut self, ctx: &RenderContext<'_>) {
        let Some(conversation) = ctx.conversation else {
            return;
        };
        self.header.title = ctx.contacts.conversation_title(conversation);
        self.header.subtitle = if conversation.is_group {
            ctx.contacts
                .group_subtitle(conversation, ctx.subtitle_max_names)
        } else {
            String::new()
        };
    }

    pub fn set_presence_subtitle(&mut self, label: Option<String>) {
        self.header.subtitle = label.unwrap_or_default();
    }

    pub fn set_typing(&mut self, label: Option<String>) {
        self.header.typing = label;
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    /// Append a row for `message`. A message whose id is already on screen
    /// is skipped.
    pub fn render(&mut self, message: &Message, ctx: &RenderContext<'_>) -> bool {
        if let Some(id) = &message.id {
            if self.node(id).is_some() {
                return false;
            }
        }
        self.drop_empty_placeholder();
        if message.kind == MessageKind::System {
            let mut row = RenderedMessage::system(message.body.clone());
            row.message_id = message.id.clone();
            row.time_label = time_label(message.created_at.as_deref(), &ctx.offset);
            self.push(row);
            return true;
        }

        let is_mine = message.is_from(ctx.local_user);
        let author = match (&message.sender_id, ctx.is_group() && !is_mine) {
            (Some(sender), true) => Some(ctx.name_of(sender)),
            _ => None,
        };
        let mut row = RenderedMessage {
            message_id: message.id.clone(),
            local_key: None,
            is_mine,
            system: false,
            author,
            body: message.body.clone(),
            time_label: message_time_label(
                message.created_at.as_deref(),
                message.edited_at.as_deref(),
                &ctx.offset,
            ),
            reply: message
                .reply_to_id
                .as_ref()
                .map(|id| self.reply_preview(id, ctx)),
            attachment: message.attachment.as_ref().map(|a| RenderedAttachment {
                kind: a.kind(),
                url: a.url.clone(),
                name: a.name.clone(),
                size: a.size,
            }),
            reaction: None,
            tick: None,
            tombstoned: false,
        };

        if message.is_tombstoned() {
            row.tombstone();
        } else if is_mine {
            if let Some(id) = &message.id {
                let tick = *self.ticks.entry(id.clone()).or_insert(TickState::Sent);
                row.tick = Some(tick);
            }
        }
        self.push(row);
        true
    }

    fn push(&mut self, row: RenderedMessage) {
        self.nodes.push(row);
        self.scroll = Some(ScrollRequest::SmoothToBottom);
    }

    pub fn append_system(&mut self, text: impl Into<String>) {
        self.push(RenderedMessage::system(text));
    }

    /// Snippet for a reply block: message cache, then the rendered row,
    /// then a placeholder.
    fn reply_preview(&self, id: &MessageId, ctx: &RenderContext<'_>) -> ReplyPreview {
        if let Some(original) = ctx.cache.get(id) {
            let is_mine = original.is_from(ctx.local_user);
            let text = if original.is_tombstoned() {
                tombstone_text(is_mine).to_string()
            } else if original.body.trim().is_empty() {
                if original.attachment.is_some() {
                    TEXT_REPLY_FILE.to_string()
                } else {
                    TEXT_REPLY_EMPTY.to_string()
                }
            } else {
                truncate_preview(&original.body)
            };
            return ReplyPreview {
                message_id: id.clone(),
                author: original.sender_id.as_ref().map(|s| ctx.name_of(s)),
                text,
            };
        }
        if let Some(node) = self.node(id) {
            let text = if node.body.trim().is_empty() {
                if node.attachment.is_some() {
                    TEXT_REPLY_FILE.to_string()
                } else {
                    TEXT_REPLY_EMPTY.to_string()
                }
            } else {
                truncate_preview(&node.body)
            };
            return ReplyPreview {
                message_id: id.clone(),
                author: node.author.clone().or_else(|| {
                    node.is_mine
                        .then(|| ctx.contacts.resolve_name(ctx.local_user, None, None))
                }),
                text,
            };
        }
        ReplyPreview {
            message_id: id.clone(),
            author: None,
            text: TEXT_REPLY_UNKNOWN.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Optimistic sends
    // -----------------------------------------------------------------------

    /// Enter the send guard. Fails if nothing is open, the thread is
    /// locked, or a send is already running.
    pub fn begin_send(&mut self) -> Result<()> {
        match self.phase {
            ThreadPhase::Closed | ThreadPhase::Loading => Err(ClientError::NoOpenConversation),
            ThreadPhase::Locked => Err(ClientError::Locked),
            ThreadPhase::Active if self.composer.sending => Err(ClientError::SendInProgress),
            ThreadPhase::Active => {
                self.composer.sending = true;
                self.composer.enabled = false;
                Ok(())
            }
        }
    }

    /// Leave the send guard. The composer is re-enabled unless the thread
    /// was locked meanwhile.
    pub fn end_send(&mut self) {
        self.composer.sending = false;
        self.composer.enabled = self.phase == ThreadPhase::Active;
        if self.composer.enabled {
            self.composer.reply_to = None;
        }
    }

    /// Show an own message before the server has assigned it an id.
    pub fn render_pending(
        &mut self,
        body: &str,
        reply_to: Option<&MessageId>,
        ctx: &RenderContext<'_>,
    ) -> Uuid {
        let key = Uuid::new_v4();
        let row = RenderedMessage {
            message_id: None,
            local_key: Some(key),
            is_mine: true,
            system: false,
            author: None,
            body: body.to_string(),
            time_label: String::new(),
            reply: reply_to.map(|id| self.reply_preview(id, ctx)),
            attachment: None,
            reaction: None,
            tick: Some(TickState::Sent),
            tombstoned: false,
        };
        self.drop_empty_placeholder();
        self.push(row);
        key
    }

    /// Attach the server copy to the optimistic row created under `key`.
    ///
    /// If the socket echo rendered the message first, the optimistic row is
    /// dropped instead.
    pub fn confirm_pending(&mut self, key: Uuid, message: &Message, offset: &FixedOffset) -> bool {
        let Some(pos) = self.nodes.iter().position(|n| n.local_key == Some(key)) else {
            return false;
        };
        let Some(id) = message.id.clone() else {
            return false;
        };
        if self.node(&id).is_some() {
            self.nodes.remove(pos);
            return true;
        }
        let tick = *self.ticks.entry(id.clone()).or_insert(TickState::Sent);
        let row = &mut self.nodes[pos];
        row.message_id = Some(id);
        row.local_key = None;
        row.body = message.body.clone();
        row.tick = Some(tick);
        row.time_label = message_time_label(
            message.created_at.as_deref(),
            message.edited_at.as_deref(),
            offset,
        );
        true
    }

    /// Remove an optimistic row whose send failed.
    pub fn discard_pending(&mut self, key: Uuid) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.local_key != Some(key));
        before != self.nodes.len()
    }

    fn drop_empty_placeholder(&mut self) {
        if let [only] = self.nodes.as_slice() {
            if only.system && only.message_id.is_none() && only.body == TEXT_NO_MESSAGES_YET {
                self.nodes.clear();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Replace the body in place and relabel the time as "Edited HH:MM".
    pub fn edit_message(
        &mut self,
        id: &MessageId,
        body: &str,
        edited_at: Option<&str>,
        offset: &FixedOffset,
    ) -> bool {
        let Some(node) = self.node_mut(id) else {
            return false;
        };
        if node.tombstoned || node.system {
            return false;
        }
        let label = message_time_label(None, edited_at.or(Some("")), offset);
        if node.body == body && node.time_label == label {
            return false;
        }
        node.body = body.to_string();
        node.time_label = label;

        let snippet = if body.trim().is_empty() {
            TEXT_REPLY_EMPTY.to_string()
        } else {
            truncate_preview(body)
        };
        for reply in self
            .nodes
            .iter_mut()
            .filter_map(|n| n.reply.as_mut())
            .filter(|r| &r.message_id == id)
        {
            reply.text = snippet.clone();
        }
        true
    }

    /// Remove a message deleted by `target_user` for themselves. Ignored
    /// unless that user is the local one.
    pub fn delete_for_me(&mut self, id: &MessageId, target_user: &UserId, local_user: &UserId) -> bool {
        if target_user != local_user {
            return false;
        }
        let before = self.nodes.len();
        self.nodes.retain(|n| !n.is(id));
        self.ticks.remove(id);
        before != self.nodes.len()
    }

    /// Tombstone in place. Replies pointing at it show the deletion notice.
    pub fn delete_for_everyone(&mut self, id: &MessageId) -> bool {
        let Some(node) = self.node_mut(id) else {
            return false;
        };
        if !node.tombstone() {
            return false;
        }
        let notice = node.body.clone();
        self.ticks.remove(id);
        for reply in self
            .nodes
            .iter_mut()
            .filter_map(|n| n.reply.as_mut())
            .filter(|r| &r.message_id == id)
        {
            reply.text = notice.clone();
        }
        true
    }

    /// Remove every own row after the backend confirmed the bulk delete.
    pub fn mass_delete_mine(&mut self) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.system || !n.is_mine);
        self.ticks.clear();
        let removed = before - self.nodes.len();
        if removed > 0 && self.nodes.iter().all(|n| n.system) {
            self.nodes.retain(|n| n.body != TEXT_NO_MESSAGES_YET);
            self.append_system(TEXT_NO_MESSAGES_YET);
        }
        removed
    }

    /// Set the single local reaction of a message. Last write wins.
    pub fn apply_reaction(&mut self, id: &MessageId, emoji: &str) -> bool {
        if self.phase != ThreadPhase::Active {
            return false;
        }
        let Some(node) = self.node_mut(id) else {
            return false;
        };
        if node.tombstoned || node.system || node.reaction.as_deref() == Some(emoji) {
            return false;
        }
        node.reaction = Some(emoji.to_string());
        true
    }

    pub fn set_reply_to(&mut self, id: Option<MessageId>) -> bool {
        if self.phase != ThreadPhase::Active {
            return false;
        }
        if let Some(id) = &id {
            if self.node(id).map_or(true, |n| n.tombstoned || n.system) {
                return false;
            }
        }
        self.composer.reply_to = id;
        true
    }

    /// Start editing an own, non-deleted message.
    pub fn set_editing(&mut self, id: Option<MessageId>) -> bool {
        if self.phase != ThreadPhase::Active {
            return false;
        }
        if let Some(id) = &id {
            if self
                .node(id)
                .map_or(true, |n| !n.is_mine || n.tombstoned || n.system)
            {
                return false;
            }
        }
        self.composer.editing = id;
        true
    }

    /// Upgrade a registered tick. Never downgrades.
    pub fn set_tick(&mut self, id: &MessageId, tick: TickState) -> bool {
        let Some(current) = self.ticks.get_mut(id) else {
            return false;
        };
        if tick <= *current {
            return false;
        }
        *current = tick;
        if let Some(node) = self.nodes.iter_mut().find(|n| n.is(id)) {
            node.tick = Some(tick);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parla_store::{Attachment, Member};

    fn me() -> UserId {
        UserId::new("me")
    }

    fn conv(group: bool, member: bool) -> Conversation {
        let m = |id: &str| Member {
            id: UserId::new(id),
            alias: None,
            name: None,
            phone: Some(format!("+{id}")),
            active: true,
            is_admin: false,
        };
        Conversation {
            id: ConversationId::new("c1"),
            is_group: group,
            title: group.then(|| "Team".to_string()),
            members: if group {
                vec![m("me"), m("u1"), m("u2")]
            } else {
                vec![m("me"), m("u1")]
            },
            creator_id: None,
            last_message_preview: String::new(),
            last_message_time: None,
            last_message_id: None,
            am_i_member: member,
            is_hidden_locally: false,
            unread: 0,
        }
    }

    fn msg(id: &str, sender: &str, body: &str) -> Message {
        Message {
            id: Some(MessageId::new(id)),
            conversation_id: ConversationId::new("c1"),
            sender_id: Some(UserId::new(sender)),
            body: body.into(),
            created_at: Some("2025-03-01T10:00:00".into()),
            edited_at: None,
            deleted_at: None,
            reply_to_id: None,
            attachment: None,
            kind: MessageKind::Normal,
        }
    }

    struct Fixture {
        me: UserId,
        contacts: ContactBook,
        cache: MessageCache,
        conversation: Conversation,
    }

    impl Fixture {
        fn new(group: bool, member: bool) -> Self {
            Self {
                me: me(),
                contacts: ContactBook::new(me()),
                cache: MessageCache::new(),
                conversation: conv(group, member),
            }
        }

        fn ctx(&self) -> RenderContext<'_> {
            RenderContext {
                local_user: &self.me,
                contacts: &self.contacts,
                cache: &self.cache,
                conversation: Some(&self.conversation),
                offset: FixedOffset::east_opt(0).unwrap(),
                subtitle_max_names: 5,
            }
        }

        fn open(&self, history: &[Message]) -> ThreadView {
            let mut view = ThreadView::new();
            view.open(self.conversation.id.clone());
            assert!(view.activate(&self.conversation, history, &self.ctx()));
            view
        }
    }

    #[test]
    fn empty_history_shows_placeholder_and_enables_composer() {
        let f = Fixture::new(false, true);
        let view = f.open(&[]);
        assert_eq!(view.phase(), ThreadPhase::Active);
        assert_eq!(view.nodes().len(), 1);
        assert!(view.nodes()[0].system);
        assert_eq!(view.nodes()[0].body, TEXT_NO_MESSAGES_YET);
        assert!(view.composer().enabled);
        assert!(view.registered_ticks().is_empty());
    }

    #[test]
    fn group_without_membership_opens_locked() {
        let f = Fixture::new(true, false);
        let mut view = f.open(&[msg("m1", "u1", "hi")]);
        assert_eq!(view.phase(), ThreadPhase::Locked);
        assert_eq!(view.nodes().len(), 1);
        assert!(!view.composer().enabled);
        assert_eq!(view.banner(), Some(TEXT_LOCKED_BANNER));
        assert!(matches!(view.begin_send(), Err(ClientError::Locked)));
        assert!(!view.apply_reaction(&MessageId::new("m1"), "👍"));
    }

    #[test]
    fn live_messages_during_loading_stay_after_history() {
        let f = Fixture::new(false, true);
        let mut view = ThreadView::new();
        view.open(f.conversation.id.clone());
        let mut live = msg("live", "u1", "just now");
        live.created_at = Some("2025-03-01T10:05:00".into());
        let mut newer = msg("newer", "u1", "and again");
        newer.created_at = Some("2025-03-01T10:06:00".into());
        assert!(view.render(&live, &f.ctx()));
        assert!(view.render(&newer, &f.ctx()));

        let mut old = msg("old", "u1", "earlier");
        old.created_at = Some("2025-03-01T09:00:00".into());
        assert!(view.activate(&f.conversation, &[old, live], &f.ctx()));

        let order: Vec<&str> = view
            .nodes()
            .iter()
            .filter_map(|n| n.message_id.as_ref().map(MessageId::as_str))
            .collect();
        assert_eq!(order, vec!["old", "live", "newer"]);
        assert!(view.nodes().iter().all(|n| !n.system));
    }

    #[test]
    fn live_message_during_loading_replaces_empty_placeholder() {
        let f = Fixture::new(false, true);
        let mut view = ThreadView::new();
        view.open(f.conversation.id.clone());
        view.render(&msg("live", "u1", "hi"), &f.ctx());
        assert!(view.activate(&f.conversation, &[], &f.ctx()));
        assert_eq!(view.nodes().len(), 1);
        assert_eq!(view.nodes()[0].body, "hi");
    }

    #[test]
    fn stale_activation_is_ignored() {
        let f = Fixture::new(false, true);
        let mut view = ThreadView::new();
        view.open(ConversationId::new("other"));
        assert!(!view.activate(&f.conversation, &[], &f.ctx()));
        assert_eq!(view.phase(), ThreadPhase::Loading);
    }

    #[test]
    fn own_group_message_has_no_author_and_a_sent_tick() {
        let f = Fixture::new(true, true);
        let view = f.open(&[msg("m1", "me", "hello"), msg("m2", "u1", "hey")]);
        let mine = view.node(&MessageId::new("m1")).unwrap();
        assert!(mine.author.is_none());
        assert_eq!(mine.tick, Some(TickState::Sent));
        let theirs = view.node(&MessageId::new("m2")).unwrap();
        assert_eq!(theirs.author.as_deref(), Some("+u1"));
        assert!(theirs.tick.is_none());
        assert_eq!(view.registered_ticks(), vec![MessageId::new("m1")]);
    }

    #[test]
    fn duplicate_render_is_skipped() {
        let f = Fixture::new(false, true);
        let mut view = f.open(&[]);
        let m = msg("m1", "u1", "hi");
        assert!(view.render(&m, &f.ctx()));
        assert!(!view.render(&m, &f.ctx()));
        assert_eq!(view.nodes().iter().filter(|n| !n.system).count(), 1);
        assert_eq!(view.take_scroll(), Some(ScrollRequest::SmoothToBottom));
        assert_eq!(view.take_scroll(), None);
    }

    #[test]
    fn reply_preview_sources() {
        let mut f = Fixture::new(false, true);
        let mut long = msg("orig", "u1", &"x".repeat(150));
        f.cache.insert(long.clone());
        let mut file_only = msg("file", "u1", " ");
        file_only.attachment = Some(Attachment {
            url: "/f/a.pdf".into(),
            kind_hint: None,
            name: "a.pdf".into(),
            size: None,
        });
        f.cache.insert(file_only);

        let mut view = f.open(&[]);
        let mut r1 = msg("r1", "me", "re");
        r1.reply_to_id = Some(MessageId::new("orig"));
        let mut r2 = msg("r2", "me", "re");
        r2.reply_to_id = Some(MessageId::new("file"));
        let mut r3 = msg("r3", "me", "re");
        r3.reply_to_id = Some(MessageId::new("missing"));
        for m in [&r1, &r2, &r3] {
            view.render(m, &f.ctx());
        }
        fn text(view: &ThreadView, id: &str) -> String {
            view.node(&MessageId::new(id))
                .and_then(|n| n.reply.clone())
                .unwrap()
                .text
        }
        assert_eq!(text(&view, "r1").chars().count(), 121);
        assert_eq!(text(&view, "r2"), TEXT_REPLY_FILE);
        assert_eq!(text(&view, "r3"), TEXT_REPLY_UNKNOWN);

        // A tombstoned original shows the deletion notice.
        long.deleted_at = Some("2025-03-01T11:00:00".into());
        f.cache.insert(long);
        let mut r4 = msg("r4", "me", "re");
        r4.reply_to_id = Some(MessageId::new("orig"));
        view.render(&r4, &f.ctx());
        assert_eq!(text(&view, "r4"), crate::render::tombstone_text(false));
    }

    #[test]
    fn render_then_tombstone_strips_decorations() {
        let mut f = Fixture::new(false, true);
        f.cache.insert(msg("orig", "u1", "first"));
        let mut view = f.open(&[]);
        let mut m = msg("m1", "me", "reply");
        m.reply_to_id = Some(MessageId::new("orig"));
        view.render(&m, &f.ctx());
        let id = MessageId::new("m1");
        assert!(view.apply_reaction(&id, "👍"));

        assert!(view.delete_for_everyone(&id));
        assert!(!view.delete_for_everyone(&id));
        let node = view.node(&id).unwrap();
        assert!(node.reply.is_none() && node.reaction.is_none());
        assert_eq!(node.body, "You deleted this message");
        assert!(view.tick(&id).is_none());
        assert!(!view.apply_reaction(&id, "❤"));
    }

    #[test]
    fn edit_relabels_and_keeps_position() {
        let f = Fixture::new(false, true);
        let mut view = f.open(&[msg("m1", "u1", "a"), msg("m2", "u1", "b")]);
        let id = MessageId::new("m1");
        assert!(view.edit_message(&id, "a2", Some("2025-03-01T12:30:00"), &f.ctx().offset));
        assert!(!view.edit_message(&id, "a2", Some("2025-03-01T12:30:00"), &f.ctx().offset));
        assert!(view.nodes()[0].is(&id));
        assert_eq!(view.nodes()[0].body, "a2");
        assert_eq!(view.nodes()[0].time_label, "Edited 12:30");
        assert!(!view.edit_message(&MessageId::new("nope"), "x", None, &f.ctx().offset));
    }

    #[test]
    fn delete_for_me_only_applies_to_local_user() {
        let f = Fixture::new(false, true);
        let mut view = f.open(&[msg("m1", "u1", "a")]);
        let id = MessageId::new("m1");
        assert!(!view.delete_for_me(&id, &UserId::new("u1"), &f.me));
        assert!(view.delete_for_me(&id, &f.me, &f.me));
        assert!(!view.delete_for_me(&id, &f.me, &f.me));
        assert!(view.node(&id).is_none());
    }

    #[test]
    fn mass_delete_leaves_others_and_placeholder() {
        let f = Fixture::new(false, true);
        let mut view = f.open(&[msg("m1", "me", "a"), msg("m2", "me", "b")]);
        assert_eq!(view.mass_delete_mine(), 2);
        assert_eq!(view.nodes().len(), 1);
        assert_eq!(view.nodes()[0].body, TEXT_NO_MESSAGES_YET);

        let mut view = f.open(&[msg("m1", "me", "a"), msg("m2", "u1", "b")]);
        assert_eq!(view.mass_delete_mine(), 1);
        assert!(view.node(&MessageId::new("m2")).is_some());
    }

    #[test]
    fn send_guard_and_pending_confirmation() {
        let f = Fixture::new(false, true);
        let mut view = f.open(&[]);
        view.begin_send().unwrap();
        assert!(matches!(view.begin_send(), Err(ClientError::SendInProgress)));
        let key = view.render_pending("hello", None, &f.ctx());
        assert_eq!(view.nodes().len(), 1);

        let confirmed = msg("m9", "me", "hello");
        assert!(view.confirm_pending(key, &confirmed, &f.ctx().offset));
        view.end_send();
        assert!(view.composer().enabled);
        assert_eq!(view.tick(&MessageId::new("m9")), Some(TickState::Sent));
        assert!(view.node(&MessageId::new("m9")).unwrap().local_key.is_none());
    }

    #[test]
    fn lock_mid_send_keeps_composer_disabled() {
        let f = Fixture::new(true, true);
        let mut view = f.open(&[]);
        view.begin_send().unwrap();
        assert!(view.lock());
        assert!(!view.lock());
        view.end_send();
        assert!(!view.composer().enabled);
        assert_eq!(view.phase(), ThreadPhase::Locked);
    }

    #[test]
    fn ticks_never_downgrade() {
        let f = Fixture::new(false, true);
        let mut view = f.open(&[msg("m1", "me", "a")]);
        let id = MessageId::new("m1");
        assert!(view.set_tick(&id, TickState::Read));
        assert!(!view.set_tick(&id, TickState::Delivered));
        assert_eq!(view.node(&id).unwrap().tick, Some(TickState::Read));
        assert!(!view.set_tick(&MessageId::new("unregistered"), TickState::Read));
    }

    #[test]
    fn close_resets_everything() {
        let f = Fixture::new(false, true);
        let mut view = f.open(&[msg("m1", "me", "a")]);
        assert_eq!(view.close(), Some(f.conversation.id.clone()));
        assert_eq!(view.phase(), ThreadPhase::Closed);
        assert!(view.nodes().is_empty());
        assert!(matches!(view.begin_send(), Err(ClientError::NoOpenConversation)));
    }
}
