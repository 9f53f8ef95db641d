//! Database entities

pub mod sticky_mapping;

pub use sticky_mapping::Entity as StickyMapping;

pub mod prelude {
    pub use super::sticky_mapping::Entity as StickyMapping;
}
