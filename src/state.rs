//! Shared application state handed to every handler.

use std::sync::Arc;

use crate::attachment_tracker::AttachmentTracker;
use crate::config::Config;
use crate::db::Db;
use crate::libvirt::LibvirtDriver;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub libvirt: Arc<dyn LibvirtDriver>,
    pub attachments: Arc<AttachmentTracker>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: Db, libvirt: Arc<dyn LibvirtDriver>, config: Config) -> Self {
        AppState { db, libvirt, attachments: AttachmentTracker::new(), config: Arc::new(config) }
    }
}
