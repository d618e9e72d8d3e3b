//! Create/edit mode of the branch form.
//!
//! One submit handler serves both modes; the mode decides whether the
//! fields create a record or update the one being edited.

use crate::{error::Result, Fields, LocalId, Record, SyncContext};
use serde::{Deserialize, Serialize};

/// What submitting the form will do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode", content = "localId")]
pub enum FormMode {
    #[default]
    Creating,
    Editing(LocalId),
}

/// Result of a successful submit.
#[derive(Debug, Clone, PartialEq)]
pub enum FormSubmission {
    Created(LocalId),
    Updated(Record),
}

/// The branch form's mode.
#[derive(Debug, Default)]
pub struct BranchForm {
    mode: FormMode,
}

impl BranchForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> FormMode {
        self.mode
    }

    /// Switch to editing `local_id`, returning the record to populate the
    /// form with.
    ///
    /// # Errors
    /// - [`crate::Error::RecordNotFound`] if the record does not exist
    pub async fn begin_edit(&mut self, ctx: &SyncContext, local_id: LocalId) -> Result<Record> {
        let record = ctx
            .get(local_id)
            .await?
            .ok_or(crate::Error::RecordNotFound(local_id))?;
        self.mode = FormMode::Editing(local_id);
        Ok(record)
    }

    /// Leave edit mode without submitting.
    pub fn cancel(&mut self) {
        self.mode = FormMode::Creating;
    }

    /// Submit the form. On success the form goes back to creating; on
    /// failure the mode is kept so the user can correct the input.
    pub async fn submit(&mut self, ctx: &SyncContext, fields: Fields) -> Result<FormSubmission> {
        let submission = match self.mode {
            FormMode::Creating => FormSubmission::Created(ctx.submit_create(fields).await?),
            FormMode::Editing(local_id) => {
                FormSubmission::Updated(ctx.submit_update(local_id, fields).await?)
            }
        };

        self.mode = FormMode::Creating;
        Ok(submission)
    }
}
