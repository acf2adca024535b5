//! Message handler - routes decoded messages for one session

use std::sync::Arc;

use livetext_core::{validate_username, Document, DocumentMeta, DocumentUri, User};
use livetext_protocol::{
    AccountConfirmed, AccountCreate, AccountError, AccountUpdate, Direction, DocumentCreate,
    DocumentDismissed, DocumentError, DocumentOpen, DocumentRemove, FrameCodec, LoginError,
    LoginGranted, LoginRequest, LogoutConfirmed, Message, Pong, ProtocolError,
};
use livetext_storage::{AccountChanges, NewAccount, Storage, StorageError};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::registry::SessionRegistry;
use crate::session::{AttachedDocument, ClientSession, SessionHandle};

/// Handles the messages of a single client connection
pub struct MessageHandler {
    session: ClientSession,
    codec: FrameCodec,
    registry: Arc<SessionRegistry>,
    storage: Arc<dyn Storage>,
}

impl MessageHandler {
    pub fn new(
        handle: SessionHandle,
        registry: Arc<SessionRegistry>,
        max_frame_size: usize,
    ) -> Self {
        let storage = registry.storage().clone();
        Self {
            session: ClientSession::new(handle),
            codec: FrameCodec::with_max_frame_size(max_frame_size),
            registry,
            storage,
        }
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// Decode every complete frame in `data` and handle it in order.
    ///
    /// An error ends the session; replies already queued are still delivered.
    pub async fn process(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.codec.feed(data);
        while let Some(message) = self.codec.decode()? {
            self.handle(message).await?;
        }
        Ok(())
    }

    /// Handle a single message
    pub async fn handle(&mut self, message: Message) -> Result<(), TransportError> {
        debug!(session = self.session.id(), message = message.name(), "Processing message");

        if message.direction() == Direction::ToClient {
            let reason = format!("{} is sent by the server only", message.name());
            return Err(ProtocolError::Unexpected(reason).into());
        }

        match message {
            Message::Ping(_) => {
                self.reply(Pong);
            }
            Message::Pong(_) => {}
            Message::LoginRequest(request) => self.handle_login(request).await?,
            Message::Logout(_) => self.handle_logout().await,
            Message::AccountCreate(request) => self.handle_account_create(request).await?,
            Message::AccountUpdate(request) => self.handle_account_update(request).await?,
            Message::DocumentCreate(request) => self.handle_document_create(request).await?,
            Message::DocumentOpen(request) => self.handle_document_open(request).await?,
            Message::DocumentRemove(request) => self.handle_document_remove(request).await?,
            Message::DocumentClose(_) => self.close_document().await,
            Message::CursorMove(moved) => match &self.session.document {
                Some(attached) => {
                    attached.workspace.cursor(self.session.id(), moved.position).await?;
                }
                None => debug!(session = self.session.id(), "Cursor move without a document"),
            },
            edit if edit.is_edit() => match &self.session.document {
                Some(attached) => attached.workspace.edit(self.session.id(), edit).await?,
                None => {
                    return Err(ProtocolError::Unexpected(format!(
                        "{} without an open document",
                        edit.name()
                    ))
                    .into())
                }
            },
            other => {
                return Err(ProtocolError::Unexpected(other.name().to_string()).into());
            }
        }
        Ok(())
    }

    fn reply(&self, message: impl Into<Message>) {
        self.session.handle.send(message);
    }

    /// Log a storage failure and word the reason sent back; the session stays open.
    fn storage_fault(&self, request: &str, error: &StorageError) -> String {
        warn!(session = self.session.id(), request, error = %error, "Storage request failed");
        format!("{} failed, please retry later", request)
    }

    async fn handle_login(&mut self, request: LoginRequest) -> Result<(), TransportError> {
        if self.session.user.is_some() {
            self.reply(LoginError {
                reason: "Already logged in".into(),
            });
            return Ok(());
        }

        let user = match self.storage.verify_login(&request.username, &request.password).await {
            Ok(Some(user)) => user,
            Err(e) => {
                self.reply(LoginError {
                    reason: self.storage_fault("Login", &e),
                });
                return Ok(());
            }
            Ok(None) => {
                warn!(session = self.session.id(), username = %request.username, "Login refused");
                self.reply(LoginError {
                    reason: "Invalid username or password".into(),
                });
                return Ok(());
            }
        };

        if !self.registry.login(user.user_id, self.session.id()) {
            warn!(session = self.session.id(), user_id = user.user_id, "User already connected");
            self.reply(LoginError {
                reason: "User is already connected".into(),
            });
            return Ok(());
        }

        info!(
            session = self.session.id(),
            user_id = user.user_id,
            username = %user.username,
            "User logged in"
        );
        self.session.user = Some(user.clone());
        self.reply(LoginGranted { user });
        Ok(())
    }

    async fn handle_logout(&mut self) {
        self.close_document().await;
        if let Some(user) = self.session.user.take() {
            self.registry.logout(user.user_id, self.session.id());
            info!(session = self.session.id(), user_id = user.user_id, "User logged out");
        }
        self.reply(LogoutConfirmed);
    }

    async fn handle_account_create(
        &mut self,
        request: AccountCreate,
    ) -> Result<(), TransportError> {
        let refuse = |reason: String| AccountError { reason };

        if self.session.user.is_some() {
            self.reply(refuse("Log out before creating an account".into()));
            return Ok(());
        }
        if let Err(e) = validate_username(&request.username) {
            self.reply(refuse(e.to_string()));
            return Ok(());
        }
        if request.password.is_empty() {
            self.reply(refuse("Password cannot be empty".into()));
            return Ok(());
        }

        let account = NewAccount {
            username: request.username,
            nickname: request.nickname,
            icon: request.icon,
            password: request.password,
        };
        let user = match self.storage.create_account(&account).await {
            Ok(Some(user)) => user,
            Err(e) => {
                self.reply(refuse(self.storage_fault("Account creation", &e)));
                return Ok(());
            }
            Ok(None) => {
                self.reply(refuse(format!("Username {} is taken", account.username)));
                return Ok(());
            }
        };

        // A fresh account cannot be held by another session.
        self.registry.login(user.user_id, self.session.id());
        info!(
            session = self.session.id(),
            user_id = user.user_id,
            username = %user.username,
            "Account created"
        );
        self.session.user = Some(user.clone());
        self.reply(AccountConfirmed { user });
        Ok(())
    }

    async fn handle_account_update(
        &mut self,
        request: AccountUpdate,
    ) -> Result<(), TransportError> {
        let Some(user_id) = self.session.user.as_ref().map(|u| u.user_id) else {
            self.reply(AccountError {
                reason: "Not logged in".into(),
            });
            return Ok(());
        };
        if request.password.as_deref() == Some("") {
            self.reply(AccountError {
                reason: "Password cannot be empty".into(),
            });
            return Ok(());
        }

        let changes = AccountChanges {
            nickname: request.nickname,
            icon: request.icon,
            password: request.password,
        };
        let user = match self.storage.update_account(user_id, &changes).await {
            Ok(Some(user)) => user,
            Err(e) => {
                self.reply(AccountError {
                    reason: self.storage_fault("Account update", &e),
                });
                return Ok(());
            }
            Ok(None) => {
                self.reply(AccountError {
                    reason: "Account no longer exists".into(),
                });
                return Ok(());
            }
        };

        if let Some(attached) = &self.session.document {
            attached.workspace.profile_changed(self.session.id(), user.clone()).await?;
        }
        self.session.user = Some(user.clone());
        self.reply(AccountConfirmed { user });
        Ok(())
    }

    async fn handle_document_create(
        &mut self,
        request: DocumentCreate,
    ) -> Result<(), TransportError> {
        let Some(user) = self.session.user.clone() else {
            self.reply(DocumentError {
                reason: "Not logged in".into(),
            });
            return Ok(());
        };
        if request.name.trim().is_empty() {
            self.reply(DocumentError {
                reason: "Document name cannot be empty".into(),
            });
            return Ok(());
        }

        self.close_document().await;

        let uri = DocumentUri::generate(&user.username, &request.name);
        let meta = DocumentMeta::new(uri.clone(), request.name, user.user_id);
        let snapshot = Document::with_root_block(user.user_id).snapshot();
        match self.storage.create_document(&meta, &snapshot).await {
            Ok(true) => {}
            Ok(false) => {
                self.reply(DocumentError {
                    reason: format!("Document {} already exists", uri),
                });
                return Ok(());
            }
            Err(e) => {
                self.reply(DocumentError {
                    reason: self.storage_fault("Document creation", &e),
                });
                return Ok(());
            }
        }
        info!(session = self.session.id(), uri = %uri, "Document created");

        self.open_document(uri, user).await
    }

    async fn handle_document_open(&mut self, request: DocumentOpen) -> Result<(), TransportError> {
        let Some(user) = self.session.user.clone() else {
            self.reply(DocumentError {
                reason: "Not logged in".into(),
            });
            return Ok(());
        };

        self.close_document().await;
        self.open_document(request.uri, user).await
    }

    async fn open_document(&mut self, uri: DocumentUri, user: User) -> Result<(), TransportError> {
        let user_id = user.user_id;
        match self.registry.attach(&uri, self.session.handle.clone(), user).await {
            Ok(workspace) => {
                self.session.document = Some(AttachedDocument {
                    uri: uri.clone(),
                    workspace,
                });
            }
            Err(e) => {
                warn!(session = self.session.id(), uri = %uri, error = %e, "Open failed");
                self.reply(DocumentError { reason: e.to_string() });
                return Ok(());
            }
        }

        // The document is open either way; only the user's document list misses it.
        if let Err(e) = self.storage.add_user_document(user_id, &uri).await {
            self.storage_fault("Recording the document", &e);
            return Ok(());
        }
        if let Some(user) = self.session.user.as_mut() {
            user.add_document(uri);
        }
        Ok(())
    }

    async fn handle_document_remove(
        &mut self,
        request: DocumentRemove,
    ) -> Result<(), TransportError> {
        let Some(user_id) = self.session.user.as_ref().map(|u| u.user_id) else {
            self.reply(DocumentError {
                reason: "Not logged in".into(),
            });
            return Ok(());
        };

        if self.session.document.as_ref().map(|d| &d.uri) == Some(&request.uri) {
            self.close_document().await;
        }

        match self.storage.remove_user_document(user_id, &request.uri).await {
            Ok(true) => {
                if let Some(user) = self.session.user.as_mut() {
                    user.remove_document(&request.uri);
                }
                self.reply(DocumentDismissed { uri: request.uri });
            }
            Ok(false) => self.reply(DocumentError {
                reason: format!("Document {} is not in your list", request.uri),
            }),
            Err(e) => self.reply(DocumentError {
                reason: self.storage_fault("Document removal", &e),
            }),
        }
        Ok(())
    }

    /// Detach from the current document, if any
    async fn close_document(&mut self) {
        if let Some(attached) = self.session.document.take() {
            debug!(session = self.session.id(), uri = %attached.uri, "Closing document");
            self.registry.detach(&attached.workspace, self.session.id()).await;
        }
    }

    /// Release everything the session holds; called once the connection is gone
    pub async fn cleanup(&mut self) {
        self.close_document().await;
        if let Some(user) = self.session.user.take() {
            self.registry.logout(user.user_id, self.session.id());
        }
    }
}
