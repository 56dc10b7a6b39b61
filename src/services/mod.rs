//! Service clients and drivers

pub mod change_stream;
pub mod checker;
pub mod ignore_lists;
pub mod reconciler;
pub mod similarity_client;
pub mod wiki_client;
