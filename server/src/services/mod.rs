//! Business logic services for the verification and release engine

pub mod audit_service;
pub mod oracle_service;
pub mod release_service;
pub mod verification_service;

pub use audit_service::AuditLogger;
pub use oracle_service::OracleService;
pub use release_service::ReleaseService;
pub use verification_service::VerificationService;
