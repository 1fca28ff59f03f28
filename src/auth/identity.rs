/// The authenticated identity of a session, established at WELCOME.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Identity {
    /// The authentication ID of the user.
    pub id: String,
    /// The role assigned to the user by the router.
    pub role: String,
}
