pub mod entities;
pub mod error;
pub mod rpc;
pub mod state_machine;

pub use entities::{
    ClientPresence, ClientRegistration, Connectivity, Delivery, DeliveryState, GroupMembership,
    GroupPresence, MemberRole, MembershipState, Message,
};
pub use error::CoreError;
pub use state_machine::{membership_transition, transition, Transition};
