//! Keeps the curriculum id to question type mapping current.
//!
//! Once an external id is bound to a question type it stays bound. A later title that
//! parses to a different canonical path is reported through the notifier and the stored
//! mapping is left alone, so a single odd payload cannot reclassify historical data.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::json;
use tracing::debug;

use crate::error::StoreError;
use crate::models::CatalogEntry;
use crate::notify::{notify_quietly, Notifier};
use crate::store::SyncStore;
use crate::taxonomy::parse_title;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: usize,
    pub refreshed: usize,
    pub drifted: usize,
    pub skipped: usize,
}

pub struct CatalogReconciler<'a> {
    store: &'a dyn SyncStore,
    notifier: &'a dyn Notifier,
}

impl<'a> CatalogReconciler<'a> {
    pub fn new(store: &'a dyn SyncStore, notifier: &'a dyn Notifier) -> Self {
        Self { store, notifier }
    }

    /// Reconcile observed `(external_id, raw_title)` pairs. Later duplicates of an id win.
    pub async fn reconcile<I, K, T>(&self, observed: I) -> Result<ReconcileSummary, StoreError>
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<String>,
    {
        let batch: BTreeMap<String, String> = observed
            .into_iter()
            .map(|(id, title)| (id.into(), title.into()))
            .collect();

        let mut summary = ReconcileSummary::default();
        for (external_id, raw_title) in &batch {
            self.reconcile_one(external_id, raw_title, &mut summary).await?;
        }
        Ok(summary)
    }

    async fn reconcile_one(
        &self,
        external_id: &str,
        raw_title: &str,
        summary: &mut ReconcileSummary,
    ) -> Result<(), StoreError> {
        let Some(parsed) = parse_title(raw_title) else {
            debug!(external_id, raw_title, "skipping unparseable curriculum title");
            summary.skipped += 1;
            return Ok(());
        };

        if let Some(entry) = self.store.get_catalog_entry(external_id).await? {
            let stored = self.store.get_question_type(entry.question_type_id).await?;
            let stored_path = stored.as_ref().map(|qt| qt.canonical_path.as_str());
            if stored_path != Some(parsed.canonical_path.as_str()) {
                summary.drifted += 1;
                notify_quietly(
                    self.notifier,
                    "curriculum title drifted from its stored taxonomy; keeping existing mapping",
                    json!({
                        "external_id": external_id,
                        "raw_title": raw_title,
                        "question_type_id": entry.question_type_id,
                        "stored_path": stored_path,
                        "parsed_path": parsed.canonical_path,
                    }),
                )
                .await;
            }

            let subtype = match entry.subtype {
                Some(_) => None,
                None => parsed.subtype.as_deref(),
            };
            self.store
                .update_catalog_observation(external_id, raw_title, subtype)
                .await?;
            summary.refreshed += 1;
            return Ok(());
        }

        let question_type = self.store.find_or_create_question_type(&parsed).await?;
        self.store
            .upsert_catalog_entry(&CatalogEntry {
                external_id: external_id.to_string(),
                raw_title: raw_title.to_string(),
                question_type_id: question_type.id,
                subtype: parsed.subtype.clone(),
                active: true,
                ingested_at: Utc::now(),
            })
            .await?;
        debug!(
            external_id,
            canonical_path = %question_type.canonical_path,
            "catalog entry created"
        );
        summary.created += 1;
        Ok(())
    }
}
