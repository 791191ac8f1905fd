//! Globally comparable identifiers: [`Timestamp`], [`Tid`], and the
//! container+object identifier [`Coid`].
mod coid;
mod tid;
mod timestamp;
mod unique;

pub use coid::{
    data_cid,
    get_cid_table,
    get_dbid,
    get_table,
    is_tree_node,
    new_oid,
    oid_counter,
    oid_issuerid,
    oid_serverid,
    set_random_serverid,
    Cid,
    Coid,
    IssuerId,
    Oid,
};
pub use tid::Tid;
pub use timestamp::Timestamp;
pub use unique::process_unique_id;
