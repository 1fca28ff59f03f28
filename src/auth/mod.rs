pub mod auth_method;
pub mod credentials;
pub mod identity;
pub mod user;
pub mod wampcra;

pub use auth_method::AuthMethod;
pub use credentials::{
    ClientCredentials,
    SecretProvider,
};
pub use identity::Identity;
pub use user::{
    CraUser,
    CraUserDatabase,
    MemoryCraUserDatabase,
};
