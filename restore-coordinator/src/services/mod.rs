pub mod dispatcher;
pub mod helpers;
pub mod history;
pub mod plugins;
pub mod postdata;
pub mod redistribute;
pub mod report;
pub mod restore;
pub mod statements;
