pub mod backup;
pub mod init;
pub mod ls;
pub mod printproto;
pub mod restore;
pub mod validate;
pub mod versions;
