pub mod document_service;
pub mod local_store;
pub mod metadata_repository;
pub mod object_store;
pub mod s3_store;
