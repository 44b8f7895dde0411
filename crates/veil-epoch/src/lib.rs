pub mod keys;
pub mod manager;

pub use keys::{
    create_first_epoch, rotate, traverse_chain, unwrap_epoch_key, wrap_for_member, FirstEpoch,
    MemberWrap, RotationBundle,
};
pub use manager::{rotation_required_error, EpochManager, RotationSubmission};
