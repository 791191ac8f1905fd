//! Server-side operational counters, registered with the shared
//! shared process metrics registry the way every other binary in this
//! workspace does it.
use metrics::register_yesquel_counter;

register_yesquel_counter!(pub(crate) PREPARE_YES_TOTAL, "Prepares that voted yes");
register_yesquel_counter!(pub(crate) PREPARE_NO_TOTAL, "Prepares that voted no (conflict)");
register_yesquel_counter!(pub(crate) COMMIT_TOTAL, "Transactions committed");
register_yesquel_counter!(pub(crate) ABORT_TOTAL, "Transactions aborted");
register_yesquel_counter!(pub(crate) SPLIT_TOTAL, "Tree splits committed by the splitter task");
