// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Episode downloads: transfers, file layout and derived download state.

mod coordinator;
mod filename;
mod probe;
mod state;
mod transfer;

pub use coordinator::{DeleteSummary, DownloadCoordinator, StartOutcome};
pub use filename::storage_filename;
pub use probe::{DurationProbe, SymphoniaProbe};
pub use state::{DownloadState, StateCells};
pub use transfer::{
    HttpTransfer, TaskId, TransferBackend, TransferEvent, TransferRequest, transfer_to_file,
};
