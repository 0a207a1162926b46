pub mod interactive;
pub use self::interactive::*;
