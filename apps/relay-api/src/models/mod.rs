pub mod workspace_event;
