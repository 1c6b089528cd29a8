//! Authentication and authorization: the RBAC catalog with cached
//! privilege contexts, and the SASL negotiation boundary.

mod privilege;
mod sasl;

pub use privilege::{
    required_privilege, Domain, Privilege, PrivilegeAccess, PrivilegeContext, RbacDatabase,
    RbacError, UserEntry,
};
pub use sasl::{
    list_mechanisms, CnonceCallback, Mechanism, PasswordDatabase, SaslError, SaslSession,
    SaslStep,
};
