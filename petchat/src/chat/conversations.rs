//! Contact list for the conversation picker.

use std::sync::Arc;

use petchat_proto::message::UserId;

use crate::api::{ChatApi, User};

/// Everyone the local user has chatted with, searchable by name.
pub struct ConversationList<A> {
    api: Arc<A>,
    me: UserId,
    users: Vec<User>,
}

impl<A: ChatApi> ConversationList<A> {
    /// An empty list for `me`. Call [`refresh`](Self::refresh) to fill it.
    pub const fn new(api: Arc<A>, me: UserId) -> Self {
        Self {
            api,
            me,
            users: Vec::new(),
        }
    }

    /// Reload the contacts from the backend.
    ///
    /// On failure the list is emptied and the error logged; the caller
    /// gets an empty slice rather than an error.
    pub async fn refresh(&mut self) -> &[User] {
        match self.api.chat_users(self.me).await {
            Ok(users) => {
                let me = self.me;
                self.users = users.into_iter().filter(|u| u.id != me).collect();
                tracing::debug!(count = self.users.len(), "contacts loaded");
            }
            Err(e) => {
                tracing::warn!(me = %self.me, err = %e, "could not load contacts");
                self.users.clear();
            }
        }
        &self.users
    }

    /// All loaded contacts, in backend order.
    #[must_use]
    pub fn users(&self) -> &[User] {
        &self.users
    }

    /// Contacts whose first name, last name or full name contains `query`,
    /// ignoring case. A blank query matches everyone.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<&User> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.users.iter().collect();
        }
        self.users
            .iter()
            .filter(|user| {
                let first = user.firstname.as_deref().unwrap_or_default().to_lowercase();
                let last = user.lastname.as_deref().unwrap_or_default().to_lowercase();
                let full = format!("{first} {last}");
                first.contains(&needle) || last.contains(&needle) || full.contains(&needle)
            })
            .collect()
    }
}
