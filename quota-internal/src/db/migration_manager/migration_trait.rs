use crate::error::Error;
use async_trait::async_trait;

#[async_trait]
pub trait Migration {
    // Lives on the trait so that `&self` is the concrete type, which keeps
    // `name()` meaningful when called through `dyn Migration`.
    fn name(&self) -> String {
        let full_name = std::any::type_name_of_val(&self)
            .split("::")
            .last()
            .unwrap_or("Unknown migration");
        // "Migration0001<'_>" -> "Migration0001"
        full_name.split('<').next().unwrap_or(full_name).to_string()
    }
    async fn can_apply(&self) -> Result<(), Error>;
    async fn should_apply(&self) -> Result<bool, Error>;
    async fn apply(&self, clean_start: bool) -> Result<(), Error>;
    /// SQL statements that undo the migration, one per line.
    fn rollback_instructions(&self) -> String;
    async fn has_succeeded(&self) -> Result<bool, Error>;
}
