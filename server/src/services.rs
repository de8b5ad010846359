pub mod signservice;
